//! Event envelope and builders.
//!
//! An event is one client-issued JSON report: a state change, a lifecycle
//! notification, or a user-initiated request. The wire shape is
//! `{"event":{"header":{...},"payload":{...}},"context":[...]}` with absent
//! payload fields omitted entirely.
//!
//! The constructors below cover the full catalog the service expects:
//! recognition, state synchronization, speaker changes, playback and speech
//! lifecycle, transport-control reports and alert lifecycle.

use serde::Serialize;

use crate::uuid::Uuid;

/// Audio profile reported with recognize requests.
const PROFILE_NEAR_FIELD: &str = "NEAR_FIELD";

/// PCM format reported with recognize requests: 16 kHz mono 16-bit.
const FORMAT_PCM_16K: &str = "AUDIO_L16_RATE_16000_CHANNELS_1";

/// Complete event envelope as POSTed to the events endpoint.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EventWrapper {
    pub event: Event,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<Event>,
}

/// One client-issued event.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Event {
    pub header: Header,
    pub payload: Payload,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub namespace: String,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialog_request_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_in_milliseconds: Option<u64>,
}

impl EventWrapper {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            event: Event {
                header: Header {
                    namespace: namespace.to_owned(),
                    name: name.to_owned(),
                    message_id: Some(Uuid::fast_v4().to_string()),
                    dialog_request_id: None,
                },
                payload: Payload::default(),
            },
            context: Vec::new(),
        }
    }

    fn with_token(namespace: &str, name: &str, token: &str) -> Self {
        let mut wrapper = Self::new(namespace, name);
        wrapper.event.payload.token = Some(token.to_owned());
        wrapper
    }

    /// Serializes to the newline-terminated JSON body the service expects.
    ///
    /// # Errors
    ///
    /// Will return `Err` if serialization fails, which would indicate a bug
    /// in the envelope types rather than bad input.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self).map(|json| json + "\n")
    }

    /// A user speech-recognition request. The audio itself travels as a
    /// separate multipart body part.
    #[must_use]
    pub fn recognize(dialog_request_id: &str) -> Self {
        let mut wrapper = Self::new("SpeechRecognizer", "Recognize");
        wrapper.event.header.dialog_request_id = Some(dialog_request_id.to_owned());
        wrapper.event.payload.profile = Some(PROFILE_NEAR_FIELD.to_owned());
        wrapper.event.payload.format = Some(FORMAT_PCM_16K.to_owned());
        wrapper
    }

    /// Flushes server-side queued directives; sent when the down-channel
    /// opens.
    #[must_use]
    pub fn synchronize_state() -> Self {
        Self::new("System", "SynchronizeState")
    }

    /// Reports a volume or mute change applied on the device.
    #[must_use]
    pub fn volume_changed(volume: i64, muted: bool) -> Self {
        let mut wrapper = Self::new("Speaker", "VolumeChanged");
        wrapper.event.payload.volume = Some(volume);
        wrapper.event.payload.muted = Some(muted);
        wrapper
    }

    /// Reports a mute toggle without a level change.
    #[must_use]
    pub fn mute_changed(muted: bool) -> Self {
        let mut wrapper = Self::new("Speaker", "VolumeChanged");
        wrapper.event.payload.muted = Some(muted);
        wrapper
    }

    /// Reports that the capture window opened by `ExpectSpeech` elapsed
    /// without user speech.
    #[must_use]
    pub fn expect_speech_timed_out() -> Self {
        Self::new("SpeechRecognizer", "ExpectSpeechTimedOut")
    }

    #[must_use]
    pub fn playback_started(token: &str, offset_ms: u64) -> Self {
        let mut wrapper = Self::with_token("AudioPlayer", "PlaybackStarted", token);
        wrapper.event.payload.offset_in_milliseconds = Some(offset_ms);
        wrapper
    }

    #[must_use]
    pub fn playback_finished(token: &str) -> Self {
        Self::with_token("AudioPlayer", "PlaybackFinished", token)
    }

    /// Prompts the server for the next queue item before the current one
    /// drains.
    #[must_use]
    pub fn playback_nearly_finished(token: &str, offset_ms: u64) -> Self {
        let mut wrapper = Self::with_token("AudioPlayer", "PlaybackNearlyFinished", token);
        wrapper.event.payload.offset_in_milliseconds = Some(offset_ms);
        wrapper
    }

    #[must_use]
    pub fn speech_started(token: &str) -> Self {
        Self::with_token("SpeechSynthesizer", "SpeechStarted", token)
    }

    #[must_use]
    pub fn speech_finished(token: &str) -> Self {
        Self::with_token("SpeechSynthesizer", "SpeechFinished", token)
    }

    #[must_use]
    pub fn speech_nearly_finished(token: &str, offset_ms: u64) -> Self {
        let mut wrapper = Self::with_token("SpeechSynthesizer", "PlaybackNearlyFinished", token);
        wrapper.event.payload.offset_in_milliseconds = Some(offset_ms);
        wrapper
    }

    /// Reports a user-initiated transport control (Play, Pause, Next,
    /// Previous) as the corresponding `PlaybackController` event.
    #[must_use]
    pub fn transport_command_issued(name: &str) -> Self {
        Self::new("PlaybackController", name)
    }

    #[must_use]
    pub fn set_alert_succeeded(token: &str) -> Self {
        Self::with_token("Alerts", "SetAlertSucceeded", token)
    }

    #[must_use]
    pub fn set_alert_failed(token: &str) -> Self {
        Self::with_token("Alerts", "SetAlertFailed", token)
    }

    #[must_use]
    pub fn delete_alert_succeeded(token: &str) -> Self {
        Self::with_token("Alerts", "DeleteAlertSucceeded", token)
    }

    #[must_use]
    pub fn delete_alert_failed(token: &str) -> Self {
        Self::with_token("Alerts", "DeleteAlertFailed", token)
    }

    #[must_use]
    pub fn alert_started(token: &str) -> Self {
        Self::with_token("Alerts", "AlertStarted", token)
    }

    #[must_use]
    pub fn alert_stopped(token: &str) -> Self {
        Self::with_token("Alerts", "AlertStopped", token)
    }

    #[must_use]
    pub fn alert_entered_foreground(token: &str) -> Self {
        Self::with_token("Alerts", "AlertEnteredForeground", token)
    }

    #[must_use]
    pub fn alert_entered_background(token: &str) -> Self {
        Self::with_token("Alerts", "AlertEnteredBackground", token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognize_carries_profile_and_format() {
        let wrapper = EventWrapper::recognize("dialog-1");
        let json = wrapper.to_json().unwrap();
        assert!(json.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let header = &value["event"]["header"];
        assert_eq!(header["namespace"], "SpeechRecognizer");
        assert_eq!(header["name"], "Recognize");
        assert_eq!(header["dialogRequestId"], "dialog-1");
        assert!(header["messageId"].is_string());

        let payload = &value["event"]["payload"];
        assert_eq!(payload["profile"], "NEAR_FIELD");
        assert_eq!(payload["format"], "AUDIO_L16_RATE_16000_CHANNELS_1");
    }

    #[test]
    fn absent_payload_fields_are_omitted() {
        let wrapper = EventWrapper::synchronize_state();
        let value: serde_json::Value =
            serde_json::from_str(&wrapper.to_json().unwrap()).unwrap();
        let payload = value["event"]["payload"].as_object().unwrap();
        assert!(payload.is_empty());
        assert!(value.get("context").is_none());
    }

    #[test]
    fn volume_changed_reports_level_and_mute() {
        let wrapper = EventWrapper::volume_changed(42, false);
        let value: serde_json::Value =
            serde_json::from_str(&wrapper.to_json().unwrap()).unwrap();
        assert_eq!(value["event"]["payload"]["volume"], 42);
        assert_eq!(value["event"]["payload"]["muted"], false);
    }

    #[test]
    fn transport_reports_use_the_controller_namespace() {
        let wrapper = EventWrapper::transport_command_issued("PlayCommandIssued");
        assert_eq!(wrapper.event.header.namespace, "PlaybackController");
        assert_eq!(wrapper.event.header.name, "PlayCommandIssued");
    }

    #[test]
    fn alert_events_share_namespace() {
        for wrapper in [
            EventWrapper::set_alert_succeeded("t"),
            EventWrapper::set_alert_failed("t"),
            EventWrapper::delete_alert_succeeded("t"),
            EventWrapper::delete_alert_failed("t"),
            EventWrapper::alert_started("t"),
            EventWrapper::alert_stopped("t"),
            EventWrapper::alert_entered_foreground("t"),
            EventWrapper::alert_entered_background("t"),
        ] {
            assert_eq!(wrapper.event.header.namespace, "Alerts");
            assert_eq!(wrapper.event.payload.token.as_deref(), Some("t"));
        }
    }
}
