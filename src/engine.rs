//! Command queue and execution state machine.
//!
//! The engine owns the ordered queue of decoded commands and decides what
//! runs next. At most one item drives the audio sink at a time; it stays at
//! the head of the queue until the sink reports completion. Synchronous
//! items (speaker changes, media keys, alerts) execute inline while the
//! loop keeps draining.
//!
//! All mutation goes through `&mut self` on one owning task. Feedback from
//! the audio sink and directives from the network both funnel into that
//! task, so queue transitions never race.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    command::{Alert, Batch, Command, Media, MediaKey},
    error::Result,
    protocol::event::EventWrapper,
};

/// Speaker state after a volume or mute change, reported back to the
/// service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpeakerState {
    pub volume: i64,
    pub muted: bool,
}

/// Plays speech and media items.
///
/// `play` starts the item and returns; progress and completion arrive
/// later as [`PlayerFeedback`] through the channel the implementation was
/// constructed with.
#[async_trait]
pub trait AudioSink: Send {
    async fn play(&mut self, media: &Media) -> Result<()>;
    async fn stop(&mut self);
}

/// Applies volume and mute changes on the device.
pub trait SystemAudio: Send {
    fn set_volume(&mut self, volume: i64) -> SpeakerState;
    fn adjust_volume(&mut self, delta: i64) -> SpeakerState;
    fn set_mute(&mut self, mute: bool) -> SpeakerState;
}

/// Injects transport keys into the platform media session.
pub trait MediaKeys: Send {
    fn press(&mut self, key: MediaKey);
}

/// Schedules and cancels alert firings.
///
/// The scheduler reports a firing back by having its owner call
/// [`Engine::alert_fired`] once the delay elapses.
pub trait AlertScheduler: Send {
    /// Schedules an alert to fire after `delay`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the platform refuses the schedule.
    fn schedule(&mut self, token: &str, delay: Duration) -> Result<()>;

    fn cancel(&mut self, token: &str);
}

/// Feedback from the audio sink about the item it is playing.
#[derive(Debug)]
pub enum PlayerFeedback {
    /// Periodic progress on the active item.
    Progress {
        token: String,
        position: Duration,
        /// Fraction of the item played so far, 0.0 to 1.0.
        percent: f64,
    },

    /// The active item played to its end.
    Completed { token: String },

    /// The active item failed mid-play.
    Failed {
        token: String,
        error: crate::error::Error,
    },
}

/// Session-level signals the engine cannot act on itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// The queue drained; nothing is playing.
    Idle,

    /// The service wants a follow-up utterance; the owner should open the
    /// microphone and send a recognize request within `timeout`.
    ExpectSpeech { timeout: Duration },

    /// The service wants any in-progress capture closed now.
    StopCapture,

    /// All subsequent calls should go to a different regional endpoint.
    EndpointChanged { endpoint: String },

    /// The service reported a fault to surface to the user.
    ServerFault { code: String, description: String },
}

/// Fraction of an item after which "nearly finished" fires.
const NEARLY_FINISHED_AT: f64 = 0.8;

/// The item currently driving the audio sink.
///
/// `started` and `nearly_finished` are one-shot latches, reset when the
/// next item becomes active.
struct ActiveItem {
    token: String,
    speech: bool,
    started: bool,
    nearly_finished: bool,
    position: Duration,
}

impl ActiveItem {
    fn new(token: String, speech: bool, position: Duration) -> Self {
        Self {
            token,
            speech,
            started: false,
            nearly_finished: false,
            position,
        }
    }

    fn offset_ms(&self) -> u64 {
        u64::try_from(self.position.as_millis()).unwrap_or(u64::MAX)
    }
}

/// The queue state machine.
pub struct Engine {
    queue: VecDeque<Command>,
    active: Option<ActiveItem>,

    audio: Box<dyn AudioSink>,
    speaker: Box<dyn SystemAudio>,
    keys: Box<dyn MediaKeys>,
    alerts: Box<dyn AlertScheduler>,

    /// Lifecycle events bound for the service; the session owner drains
    /// this and posts each through the authenticated event path.
    outbox: mpsc::UnboundedSender<EventWrapper>,

    /// Signals for the session owner.
    notices: mpsc::UnboundedSender<Notice>,
}

impl Engine {
    #[must_use]
    pub fn new(
        audio: Box<dyn AudioSink>,
        speaker: Box<dyn SystemAudio>,
        keys: Box<dyn MediaKeys>,
        alerts: Box<dyn AlertScheduler>,
        outbox: mpsc::UnboundedSender<EventWrapper>,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Self {
        Self {
            queue: VecDeque::new(),
            active: None,
            audio,
            speaker,
            keys,
            alerts,
            outbox,
            notices,
        }
    }

    /// Whether an item is currently driving the audio sink.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.active.is_some()
    }

    /// Ingests one decoded batch and advances the queue.
    ///
    /// Queue markers take effect here: a clear-all marker stops the active
    /// item and empties the queue; a clear-enqueued marker drops pending
    /// items but leaves the active one playing. Everything else is
    /// appended in batch order.
    pub async fn ingest(&mut self, batch: Batch) {
        for command in batch {
            match command {
                Command::ClearAll => {
                    self.stop_active().await;
                    self.queue.clear();
                }
                Command::ClearEnqueued => {
                    if self.active.is_some() {
                        self.queue.truncate(1);
                    } else {
                        self.queue.clear();
                    }
                }
                Command::Stop => {
                    // Stops whatever is playing at the moment the directive
                    // is processed, not a queued position.
                    if self.active.is_some() {
                        self.stop_active().await;
                        self.queue.pop_front();
                    }
                }
                other => self.queue.push_back(other),
            }
        }

        self.check_queue().await;
    }

    /// Drains the queue until an item starts playing or the queue empties.
    ///
    /// A playable item stays at the head until the sink reports
    /// completion; synchronous items execute inline and the loop
    /// continues.
    pub async fn check_queue(&mut self) {
        if self.active.is_some() {
            return;
        }

        loop {
            let Some(command) = self.queue.pop_front() else {
                let _ = self.notices.send(Notice::Idle);
                return;
            };

            match command {
                Command::Speak(ref media) | Command::Play(ref media) => {
                    let speech = matches!(command, Command::Speak(_));
                    match self.audio.play(media).await {
                        Ok(()) => {
                            self.active = Some(ActiveItem::new(
                                media.token.clone(),
                                speech,
                                media.offset,
                            ));
                            // Head of queue until completion.
                            self.queue.push_front(command);
                            return;
                        }
                        Err(e) => error!("dropping unplayable item: {e}"),
                    }
                }
                // Consumed during ingest; inert if one slips through.
                Command::Stop | Command::ClearAll | Command::ClearEnqueued => {}
                Command::StopCapture => {
                    let _ = self.notices.send(Notice::StopCapture);
                }
                Command::ExpectSpeech { timeout } => {
                    // Hard clearing point: nothing queued survives.
                    self.stop_active().await;
                    self.queue.clear();
                    let _ = self.notices.send(Notice::ExpectSpeech { timeout });
                    return;
                }
                Command::SetVolume { volume } => {
                    let state = self.speaker.set_volume(volume);
                    self.emit(EventWrapper::volume_changed(state.volume, state.muted));
                }
                Command::AdjustVolume { delta } => {
                    let state = self.speaker.adjust_volume(delta);
                    self.emit(EventWrapper::volume_changed(state.volume, state.muted));
                }
                Command::SetMute { mute } => {
                    let state = self.speaker.set_mute(mute);
                    self.emit(EventWrapper::mute_changed(state.muted));
                }
                Command::MediaKey(key) => self.keys.press(key),
                Command::SetAlert(ref alert) => self.schedule_alert(alert),
                Command::DeleteAlert { ref token } => {
                    self.alerts.cancel(token);
                    self.emit(EventWrapper::delete_alert_succeeded(token));
                }
                Command::SetEndpoint { endpoint } => {
                    let _ = self.notices.send(Notice::EndpointChanged { endpoint });
                }
                Command::ServerError { code, description } => {
                    warn!("service fault {code}: {description}");
                    let _ = self.notices.send(Notice::ServerFault { code, description });
                }
                Command::Unrecognized { namespace, name } => {
                    debug!("discarding unrecognized command {namespace}:{name}");
                }
            }
        }
    }

    /// Routes feedback from the audio sink.
    ///
    /// Feedback for anything but the active item is stale and ignored.
    pub async fn feedback(&mut self, feedback: PlayerFeedback) {
        match feedback {
            PlayerFeedback::Progress {
                token,
                position,
                percent,
            } => self.progress(&token, position, percent),
            PlayerFeedback::Completed { token } => {
                let Some(active) = self.active.take_if(|item| item.token == token) else {
                    debug!("ignoring stale completion for {token}");
                    return;
                };
                self.queue.pop_front();
                if active.speech {
                    self.emit(EventWrapper::speech_finished(&active.token));
                } else {
                    self.emit(EventWrapper::playback_finished(&active.token));
                }
                self.check_queue().await;
            }
            PlayerFeedback::Failed { token, error } => {
                let Some(_) = self.active.take_if(|item| item.token == token) else {
                    debug!("ignoring stale failure for {token}");
                    return;
                };
                error!("dropping failed item {token}: {error}");
                self.queue.pop_front();
                self.check_queue().await;
            }
        }
    }

    fn progress(&mut self, token: &str, position: Duration, percent: f64) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.token != token {
            return;
        }
        active.position = position;

        // Flip the latches while the item is borrowed, emit afterwards.
        let speech = active.speech;
        let offset = active.offset_ms();
        let token = active.token.clone();
        let started = !std::mem::replace(&mut active.started, true);
        let nearly = percent > NEARLY_FINISHED_AT && !active.nearly_finished;
        if nearly {
            active.nearly_finished = true;
        }

        if started {
            self.emit(if speech {
                EventWrapper::speech_started(&token)
            } else {
                EventWrapper::playback_started(&token, offset)
            });
        }

        if nearly {
            self.emit(if speech {
                EventWrapper::speech_nearly_finished(&token, offset)
            } else {
                EventWrapper::playback_nearly_finished(&token, offset)
            });
        }
    }

    /// Reports that a scheduled alert fired.
    ///
    /// The observed service contract is a started/stopped pair; while
    /// other audio is active the alert additionally reports backgrounded,
    /// otherwise foregrounded.
    pub fn alert_fired(&mut self, token: &str) {
        self.emit(EventWrapper::alert_started(token));
        if self.is_playing() {
            self.emit(EventWrapper::alert_entered_background(token));
        } else {
            self.emit(EventWrapper::alert_entered_foreground(token));
        }
        self.emit(EventWrapper::alert_stopped(token));
    }

    fn schedule_alert(&mut self, alert: &Alert) {
        let delay = alert.time_until_due().unwrap_or(Duration::ZERO);
        match self.alerts.schedule(&alert.token, delay) {
            Ok(()) => {
                debug!("alert {} scheduled in {}s", alert.kind, delay.as_secs());
                self.emit(EventWrapper::set_alert_succeeded(&alert.token));
            }
            Err(e) => {
                warn!("alert schedule failed: {e}");
                self.emit(EventWrapper::set_alert_failed(&alert.token));
            }
        }
    }

    async fn stop_active(&mut self) {
        if self.active.take().is_some() {
            self.audio.stop().await;
        }
    }

    fn emit(&self, event: EventWrapper) {
        // A closed outbox means the session is tearing down.
        if self.outbox.send(event).is_err() {
            debug!("dropping lifecycle event; outbox closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn log(entries: &Log, entry: impl Into<String>) {
        entries.lock().unwrap().push(entry.into());
    }

    struct FakeSink {
        entries: Log,
        fail_tokens: Vec<String>,
    }

    #[async_trait]
    impl AudioSink for FakeSink {
        async fn play(&mut self, media: &Media) -> Result<()> {
            if self.fail_tokens.contains(&media.token) {
                return Err(crate::error::Error::internal("boom"));
            }
            log(&self.entries, format!("play:{}", media.token));
            Ok(())
        }

        async fn stop(&mut self) {
            log(&self.entries, "stop");
        }
    }

    struct FakeSpeaker {
        entries: Log,
        volume: i64,
        muted: bool,
    }

    impl SystemAudio for FakeSpeaker {
        fn set_volume(&mut self, volume: i64) -> SpeakerState {
            self.volume = volume;
            log(&self.entries, format!("volume:{volume}"));
            SpeakerState {
                volume: self.volume,
                muted: self.muted,
            }
        }

        fn adjust_volume(&mut self, delta: i64) -> SpeakerState {
            self.set_volume(self.volume + delta)
        }

        fn set_mute(&mut self, mute: bool) -> SpeakerState {
            self.muted = mute;
            log(&self.entries, format!("mute:{mute}"));
            SpeakerState {
                volume: self.volume,
                muted: self.muted,
            }
        }
    }

    struct FakeKeys(Log);

    impl MediaKeys for FakeKeys {
        fn press(&mut self, key: MediaKey) {
            log(&self.0, format!("key:{key:?}"));
        }
    }

    struct FakeAlerts(Log);

    impl AlertScheduler for FakeAlerts {
        fn schedule(&mut self, token: &str, _delay: Duration) -> Result<()> {
            log(&self.0, format!("alert:{token}"));
            Ok(())
        }

        fn cancel(&mut self, token: &str) {
            log(&self.0, format!("cancel:{token}"));
        }
    }

    struct Harness {
        engine: Engine,
        entries: Log,
        outbox: mpsc::UnboundedReceiver<EventWrapper>,
        notices: mpsc::UnboundedReceiver<Notice>,
    }

    fn harness() -> Harness {
        harness_with_failures(Vec::new())
    }

    fn harness_with_failures(fail_tokens: Vec<String>) -> Harness {
        let entries: Log = Arc::default();
        let (outbox_tx, outbox) = mpsc::unbounded_channel();
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let engine = Engine::new(
            Box::new(FakeSink {
                entries: Arc::clone(&entries),
                fail_tokens,
            }),
            Box::new(FakeSpeaker {
                entries: Arc::clone(&entries),
                volume: 30,
                muted: false,
            }),
            Box::new(FakeKeys(Arc::clone(&entries))),
            Box::new(FakeAlerts(Arc::clone(&entries))),
            outbox_tx,
            notices_tx,
        );
        Harness {
            engine,
            entries,
            outbox,
            notices,
        }
    }

    fn media(token: &str) -> Media {
        Media {
            token: token.to_owned(),
            url: format!("https://cdn/{token}.mp3"),
            audio: None,
            offset: Duration::ZERO,
        }
    }

    fn batch(commands: Vec<Command>) -> Batch {
        Batch { commands }
    }

    fn event_name(outbox: &mut mpsc::UnboundedReceiver<EventWrapper>) -> String {
        let wrapper = outbox.try_recv().expect("expected an emitted event");
        wrapper.event.header.name
    }

    #[tokio::test]
    async fn volume_applies_before_playback_starts() {
        let mut h = harness();
        h.engine
            .ingest(batch(vec![
                Command::SetVolume { volume: 50 },
                Command::Play(media("t-play")),
            ]))
            .await;

        let entries = h.entries.lock().unwrap().clone();
        assert_eq!(entries, vec!["volume:50", "play:t-play"]);
        assert_eq!(event_name(&mut h.outbox), "VolumeChanged");
    }

    #[tokio::test]
    async fn clear_all_drops_everything_including_active() {
        let mut h = harness();
        h.engine
            .ingest(batch(vec![
                Command::Play(media("t-1")),
                Command::Play(media("t-2")),
            ]))
            .await;
        assert!(h.engine.is_playing());

        h.engine
            .ingest(batch(vec![Command::ClearAll, Command::Play(media("t-3"))]))
            .await;

        let entries = h.entries.lock().unwrap().clone();
        assert_eq!(entries, vec!["play:t-1", "stop", "play:t-3"]);
    }

    #[tokio::test]
    async fn clear_enqueued_preserves_active_item() {
        let mut h = harness();
        h.engine
            .ingest(batch(vec![
                Command::Play(media("t-1")),
                Command::Play(media("t-2")),
            ]))
            .await;

        h.engine
            .ingest(batch(vec![
                Command::ClearEnqueued,
                Command::Play(media("t-3")),
            ]))
            .await;

        // t-1 still active; t-2 dropped; t-3 queued behind it.
        h.engine
            .feedback(PlayerFeedback::Completed {
                token: "t-1".to_owned(),
            })
            .await;

        let entries = h.entries.lock().unwrap().clone();
        assert_eq!(entries, vec!["play:t-1", "play:t-3"]);
    }

    #[tokio::test]
    async fn stop_halts_the_active_item() {
        let mut h = harness();
        h.engine
            .ingest(batch(vec![
                Command::Play(media("t-1")),
                Command::Play(media("t-2")),
            ]))
            .await;
        assert!(h.engine.is_playing());

        h.engine.ingest(batch(vec![Command::Stop])).await;

        // t-1 stopped and dropped; the queue advanced to t-2.
        let entries = h.entries.lock().unwrap().clone();
        assert_eq!(entries, vec!["play:t-1", "stop", "play:t-2"]);
    }

    #[tokio::test]
    async fn expect_speech_clears_queue_and_signals() {
        let mut h = harness();
        h.engine
            .ingest(batch(vec![
                Command::ExpectSpeech {
                    timeout: Duration::from_secs(5),
                },
                Command::Play(media("t-after")),
            ]))
            .await;

        assert_eq!(
            h.notices.try_recv().unwrap(),
            Notice::ExpectSpeech {
                timeout: Duration::from_secs(5)
            }
        );
        assert!(h.entries.lock().unwrap().is_empty());
        assert!(!h.engine.is_playing());
    }

    #[tokio::test]
    async fn stale_completion_is_a_no_op() {
        let mut h = harness();
        h.engine
            .ingest(batch(vec![Command::Play(media("t-1"))]))
            .await;

        h.engine
            .feedback(PlayerFeedback::Completed {
                token: "t-gone".to_owned(),
            })
            .await;

        assert!(h.engine.is_playing());
        assert!(h.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn started_and_nearly_finished_latch_once() {
        let mut h = harness();
        h.engine
            .ingest(batch(vec![Command::Play(media("t-1"))]))
            .await;

        for percent in [0.1, 0.5, 0.85, 0.95] {
            h.engine
                .feedback(PlayerFeedback::Progress {
                    token: "t-1".to_owned(),
                    position: Duration::from_secs(1),
                    percent,
                })
                .await;
        }

        assert_eq!(event_name(&mut h.outbox), "PlaybackStarted");
        assert_eq!(event_name(&mut h.outbox), "PlaybackNearlyFinished");
        assert!(h.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn speech_items_report_speech_lifecycle() {
        let mut h = harness();
        let mut item = media("t-speak");
        item.audio = Some(vec![0; 16]);
        h.engine.ingest(batch(vec![Command::Speak(item)])).await;

        h.engine
            .feedback(PlayerFeedback::Progress {
                token: "t-speak".to_owned(),
                position: Duration::ZERO,
                percent: 0.0,
            })
            .await;
        h.engine
            .feedback(PlayerFeedback::Completed {
                token: "t-speak".to_owned(),
            })
            .await;

        assert_eq!(event_name(&mut h.outbox), "SpeechStarted");
        assert_eq!(event_name(&mut h.outbox), "SpeechFinished");
        assert_eq!(h.notices.try_recv().unwrap(), Notice::Idle);
    }

    #[tokio::test]
    async fn failed_item_is_dropped_and_queue_drains() {
        let mut h = harness_with_failures(vec!["t-bad".to_owned()]);
        h.engine
            .ingest(batch(vec![
                Command::Play(media("t-bad")),
                Command::Play(media("t-good")),
            ]))
            .await;

        // t-bad failed to start, t-good took over.
        let entries = h.entries.lock().unwrap().clone();
        assert_eq!(entries, vec!["play:t-good"]);
    }

    #[tokio::test]
    async fn server_fault_is_surfaced_not_fatal() {
        let mut h = harness();
        h.engine
            .ingest(batch(vec![
                Command::ServerError {
                    code: "THROTTLED".to_owned(),
                    description: "slow down".to_owned(),
                },
                Command::SetMute { mute: true },
            ]))
            .await;

        assert_eq!(
            h.notices.try_recv().unwrap(),
            Notice::ServerFault {
                code: "THROTTLED".to_owned(),
                description: "slow down".to_owned()
            }
        );
        // The queue kept draining past the fault. Mute reports reuse the
        // VolumeChanged event name.
        assert_eq!(event_name(&mut h.outbox), "VolumeChanged");
    }

    #[tokio::test]
    async fn alerts_schedule_and_report_lifecycle() {
        let mut h = harness();
        h.engine
            .ingest(batch(vec![Command::SetAlert(Alert {
                token: "t-alert".to_owned(),
                kind: "TIMER".to_owned(),
                scheduled_time: "2099-01-01T00:00:00+00:00".to_owned(),
            })]))
            .await;

        assert_eq!(event_name(&mut h.outbox), "SetAlertSucceeded");

        h.engine.alert_fired("t-alert");
        assert_eq!(event_name(&mut h.outbox), "AlertStarted");
        assert_eq!(event_name(&mut h.outbox), "AlertEnteredForeground");
        assert_eq!(event_name(&mut h.outbox), "AlertStopped");
    }
}
