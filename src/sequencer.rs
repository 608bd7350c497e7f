//! Drives the firmware's interactive text menu.
//!
//! The firmware has no request ids: a command is answered by free text that
//! arrives interleaved with everything else on the wire. A session therefore
//! sends a command, then polls the text received since the last match until one
//! of a set of keywords shows up, and repeats. Whatever precedes a keyword is
//! consumed with it, so a later step cannot match on an earlier reply.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::time::{sleep, Instant};

use crate::config::{ChannelMode, Gain, SampleRate};
use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Pause before each command so replies to the previous one can land
pub const PRE_SEND_DELAY: Duration = Duration::from_millis(200);
/// Pause after each command
pub const SETTLE_DELAY: Duration = Duration::from_millis(150);
/// How long a keyword may take to show up
pub const KEYWORD_TIMEOUT: Duration = Duration::from_secs(15);
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Characters of received text carried by a timeout error
pub const TIMEOUT_TAIL_CHARS: usize = 300;

/// Oldest text is dropped once the response buffer holds this many bytes
const RESPONSE_BUFFER_LIMIT: usize = 16 * 1024;

// Firmware menu strings
const MENU_KEYWORDS: [&str; 2] = ["配置模式", "返回主菜单"];
const GAIN_KEYWORDS: [&str; 2] = ["PGA", "增益"];
const RATE_KEYWORDS: [&str; 2] = ["采样率", "Sample Rate"];
const CHANNEL_KEYWORDS: [&str; 2] = ["通道", "Input Channel"];
const SUCCESS_KEYWORDS: [&str; 2] = ["成功", "当前 CS1237 配置"];

const MENU_ENTER: u8 = b'C';
const MENU_ITEM_GAIN: u8 = b'1';
const MENU_ITEM_RATE: u8 = b'2';
const MENU_ITEM_CHANNEL: u8 = b'3';

/// Write half of the transport, shared between the sequencer and direct commands.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Write `bytes` and flush.
pub(crate) fn write_command(writer: &SharedWriter, bytes: &[u8]) -> Result<()> {
    let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}

// ============================================================================
// Steps
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send { bytes: Vec<u8>, settle: Duration },
    WaitFor { keywords: Vec<String>, timeout: Duration },
}

impl Step {
    pub fn send(bytes: impl Into<Vec<u8>>) -> Self {
        Step::Send {
            bytes: bytes.into(),
            settle: SETTLE_DELAY,
        }
    }

    pub fn wait_for<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Step::WaitFor {
            keywords: keywords.into_iter().map(Into::into).collect(),
            timeout: KEYWORD_TIMEOUT,
        }
    }

    /// Replace the settle delay or timeout of this step.
    pub fn within(self, duration: Duration) -> Self {
        match self {
            Step::Send { bytes, .. } => Step::Send {
                bytes,
                settle: duration,
            },
            Step::WaitFor { keywords, .. } => Step::WaitFor {
                keywords,
                timeout: duration,
            },
        }
    }
}

fn menu_steps(item: u8, submenu: [&str; 2], code: u8) -> Vec<Step> {
    vec![
        Step::send([MENU_ENTER]),
        Step::wait_for(MENU_KEYWORDS),
        Step::send([item]),
        Step::wait_for(submenu),
        Step::send([b'0' + code]),
        Step::wait_for(SUCCESS_KEYWORDS),
    ]
}

/// Menu script selecting `gain`.
pub fn gain_steps(gain: Gain) -> Vec<Step> {
    menu_steps(MENU_ITEM_GAIN, GAIN_KEYWORDS, gain.code())
}

pub fn sample_rate_steps(rate: SampleRate) -> Vec<Step> {
    menu_steps(MENU_ITEM_RATE, RATE_KEYWORDS, rate.code())
}

pub fn channel_steps(channel: ChannelMode) -> Vec<Step> {
    menu_steps(MENU_ITEM_CHANNEL, CHANNEL_KEYWORDS, channel.code())
}

// ============================================================================
// Response buffer
// ============================================================================

/// Text lines received from the device, joined with `\n`.
///
/// The reader thread appends, the sequencer matches and truncates.
#[derive(Debug, Clone, Default)]
pub struct ResponseBuffer {
    text: Arc<Mutex<String>>,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&self, line: &str) {
        let mut text = self.lock();
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(line);

        if text.len() > RESPONSE_BUFFER_LIMIT {
            let mut cut = text.len() - RESPONSE_BUFFER_LIMIT;
            while !text.is_char_boundary(cut) {
                cut += 1;
            }
            text.drain(..cut);
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn snapshot(&self) -> String {
        self.lock().clone()
    }

    /// Find the earliest occurrence of any keyword and drop everything up to and
    /// including it. Returns the keyword that matched.
    pub fn take_through_any(&self, keywords: &[String]) -> Option<String> {
        let mut text = self.lock();
        let (pos, keyword) = keywords
            .iter()
            .filter(|k| !k.is_empty())
            .filter_map(|k| text.find(k.as_str()).map(|pos| (pos, k)))
            .min_by_key(|(pos, _)| *pos)?;
        let rest = text[pos + keyword.len()..].to_string();
        *text = rest;
        Some(keyword.clone())
    }

    /// Last `chars` characters of the buffer.
    pub fn tail(&self, chars: usize) -> String {
        let text = self.lock();
        let count = text.chars().count();
        text.chars().skip(count.saturating_sub(chars)).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, String> {
        self.text.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Sequencer
// ============================================================================

/// Runs one step list at a time against the device.
///
/// Cloning shares the writer, the response buffer and the cancellation flag, so
/// a clone can cancel a session running elsewhere.
#[derive(Clone)]
pub struct CommandSequencer {
    writer: SharedWriter,
    responses: ResponseBuffer,
    cancel: Arc<AtomicBool>,
    pre_send_delay: Duration,
    poll_interval: Duration,
}

impl CommandSequencer {
    pub fn new(writer: SharedWriter, responses: ResponseBuffer) -> Self {
        Self {
            writer,
            responses,
            cancel: Arc::new(AtomicBool::new(false)),
            pre_send_delay: PRE_SEND_DELAY,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the pre-send pause and the keyword polling period.
    pub fn with_timing(mut self, pre_send_delay: Duration, poll_interval: Duration) -> Self {
        self.pre_send_delay = pre_send_delay;
        self.poll_interval = poll_interval;
        self
    }

    pub fn responses(&self) -> &ResponseBuffer {
        &self.responses
    }

    /// Ask the running session to stop at its next check.
    ///
    /// With no session running, the request stays pending and the next session
    /// stops at its first check.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Execute `steps` in order. The first failing step ends the session.
    ///
    /// A cancel request is consumed when the session ends, whatever the outcome.
    pub async fn run(&self, steps: &[Step]) -> Result<()> {
        self.responses.clear();
        let outcome = self.run_steps(steps).await;
        self.cancel.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_steps(&self, steps: &[Step]) -> Result<()> {
        for step in steps {
            self.check_cancelled()?;
            match step {
                Step::Send { bytes, settle } => {
                    sleep(self.pre_send_delay).await;
                    self.check_cancelled()?;
                    debug!("Sequencer send: {:?}", String::from_utf8_lossy(bytes));
                    write_command(&self.writer, bytes)?;
                    sleep(*settle).await;
                }
                Step::WaitFor { keywords, timeout } => {
                    self.wait_for(keywords, *timeout).await?;
                }
            }
        }
        Ok(())
    }

    async fn wait_for(&self, keywords: &[String], timeout: Duration) -> Result<()> {
        if keywords.iter().all(|k| k.is_empty()) {
            return Ok(());
        }
        debug!("Sequencer waiting for {keywords:?}");

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(keyword) = self.responses.take_through_any(keywords) {
                debug!("Sequencer matched '{keyword}'");
                return Ok(());
            }
            self.check_cancelled()?;
            if Instant::now() >= deadline {
                let tail = self.responses.tail(TIMEOUT_TAIL_CHARS);
                warn!("Timed out waiting for {keywords:?}");
                return Err(DriverError::Timeout {
                    keywords: keywords.to_vec(),
                    tail,
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            debug!("Sequencer cancelled");
            return Err(DriverError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<u8>>>);

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sequencer() -> (CommandSequencer, Recorder) {
        let recorder = Recorder::default();
        let writer: SharedWriter =
            Arc::new(Mutex::new(Box::new(recorder.clone()) as Box<dyn Write + Send>));
        let seq = CommandSequencer::new(writer, ResponseBuffer::new())
            .with_timing(Duration::ZERO, Duration::from_millis(5));
        (seq, recorder)
    }

    fn keywords(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn earliest_keyword_wins_and_prefix_is_consumed() {
        let buf = ResponseBuffer::new();
        buf.push_line("abc PGA def");
        buf.push_line("增益 ghi");
        let hit = buf.take_through_any(&keywords(&["增益", "PGA"]));
        assert_eq!(hit.as_deref(), Some("PGA"));
        assert_eq!(buf.snapshot(), " def\n增益 ghi");
        assert!(buf.take_through_any(&keywords(&["PGA"])).is_none());
    }

    #[test]
    fn tail_counts_characters() {
        let buf = ResponseBuffer::new();
        buf.push_line("采样率设置完成");
        assert_eq!(buf.tail(3), "置完成");
        assert_eq!(buf.tail(100), "采样率设置完成");
    }

    #[test]
    fn menu_scripts_follow_firmware_menu() {
        let steps = gain_steps(Gain::X64);
        assert_eq!(steps.len(), 6);
        assert_eq!(steps[0], Step::send(*b"C"));
        assert_eq!(steps[2], Step::send(*b"1"));
        assert_eq!(steps[4], Step::send(*b"2"));
        assert_eq!(steps[5], Step::wait_for(SUCCESS_KEYWORDS));

        assert_eq!(sample_rate_steps(SampleRate::Hz1280)[4], Step::send(*b"3"));
        assert_eq!(channel_steps(ChannelMode::Temperature)[2], Step::send(*b"3"));
        assert_eq!(channel_steps(ChannelMode::Temperature)[4], Step::send(*b"2"));
    }

    #[tokio::test]
    async fn wait_truncates_through_keyword() {
        let (seq, _) = sequencer();
        let responses = seq.responses().clone();
        let feeder = tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            responses.push_line("=== 配置模式 ===");
            responses.push_line("1. PGA");
        });

        let steps = [Step::wait_for(["配置模式"]).within(Duration::from_secs(2))];
        seq.run(&steps).await.unwrap();
        feeder.await.unwrap();
        assert_eq!(seq.responses().snapshot(), " ===\n1. PGA");
    }

    #[tokio::test]
    async fn timeout_reports_recent_text() {
        let (seq, _) = sequencer();
        let responses = seq.responses().clone();
        let feeder = tokio::spawn(async move {
            responses.push_line(&"x".repeat(500));
        });

        let steps = [Step::wait_for(["never"]).within(Duration::from_millis(40))];
        let err = seq.run(&steps).await.unwrap_err();
        feeder.await.unwrap();
        match err {
            DriverError::Timeout { keywords, tail } => {
                assert_eq!(keywords, vec!["never".to_string()]);
                assert_eq!(tail.chars().count(), TIMEOUT_TAIL_CHARS);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn menu_exchange_against_scripted_replies() {
        let (seq, recorder) = sequencer();
        let responses = seq.responses().clone();
        let feeder = tokio::spawn(async move {
            let replies = ["=== CS1237 配置模式 ===", "PGA 增益: 0=1 1=2 2=64 3=128", "设置成功"];
            for line in replies {
                sleep(Duration::from_millis(20)).await;
                responses.push_line(line);
            }
        });

        let steps: Vec<Step> = gain_steps(Gain::X64)
            .into_iter()
            .map(|s| match s {
                Step::Send { .. } => s.within(Duration::ZERO),
                Step::WaitFor { .. } => s.within(Duration::from_secs(2)),
            })
            .collect();
        seq.run(&steps).await.unwrap();
        feeder.await.unwrap();
        assert_eq!(recorder.0.lock().unwrap().as_slice(), b"C12");
    }

    #[tokio::test]
    async fn cancel_interrupts_a_wait() {
        let (seq, _) = sequencer();
        let handle = seq.clone();
        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        let steps = [Step::wait_for(["never"]).within(Duration::from_secs(5))];
        let err = seq.run(&steps).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, DriverError::Cancelled));
    }

    #[tokio::test]
    async fn cancel_before_run_stops_only_the_next_session() {
        let (seq, recorder) = sequencer();
        seq.cancel();

        let steps = [Step::send(*b"S")];
        let err = seq.run(&steps).await.unwrap_err();
        assert!(matches!(err, DriverError::Cancelled));
        assert!(recorder.0.lock().unwrap().is_empty());

        seq.run(&steps).await.unwrap();
        assert_eq!(recorder.0.lock().unwrap().as_slice(), b"S");
    }
}
