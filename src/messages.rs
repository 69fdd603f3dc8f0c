use std::{
    error::Error,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

/// Milliseconds since the unix epoch, used for message envelopes.
pub fn timestamp() -> u64 {
    let duration_since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time too far in the past");

    duration_since_epoch
        .as_millis()
        .try_into()
        .expect("System time too far in the future")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHelloMsgBodyV1 {
    pub agent: String,
    pub page_href: String,
    pub top_frame: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserveSpecV1 {
    pub subtree: bool,
    pub child_list: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotkeySpecV1 {
    pub alt: bool,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHelloAckMsgBodyV1 {
    pub observe: ObserveSpecV1,
    pub hotkey: HotkeySpecV1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionClosedReasonV1 {
    #[serde(rename = "server_error")]
    ServerError,

    #[serde(rename = "frame_rejected")]
    FrameRejected,

    #[serde(rename = "handshake_timeout")]
    HandshakeTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionClosedMsgBodyV1 {
    pub reason: ConnectionClosedReasonV1,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionClientErrorMsgBodyV1 {
    pub message: String,
}

/// Playback state of a media element as the agent last saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaStateV1 {
    pub playback_rate: f64,
    pub media_error: bool,
}

/// A serialized node subtree. Non-element nodes (text, comments) carry no tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescV1 {
    pub id: u64,

    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default)]
    pub media: Option<MediaStateV1>,

    #[serde(default)]
    pub children: Vec<NodeDescV1>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshotMsgBodyV1 {
    pub root: NodeDescV1,
}

/// One observer record: nodes added under (and removed from) a parent node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecordV1 {
    pub target: u64,

    #[serde(default)]
    pub added: Vec<NodeDescV1>,

    #[serde(default)]
    pub removed: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMutationsMsgBodyV1 {
    pub records: Vec<MutationRecordV1>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateControlV1 {
    #[serde(rename = "number_field")]
    NumberField,

    #[serde(rename = "slider")]
    Slider,
}

/// Raw text from one of the panel's rate inputs, exactly as the page produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRateEntryMsgBodyV1 {
    pub value: String,
    pub control: RateControlV1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepDirectionV1 {
    #[serde(rename = "up")]
    Up,

    #[serde(rename = "down")]
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRateStepMsgBodyV1 {
    pub direction: StepDirectionV1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPromptReplyMsgBodyV1 {
    /// `None` when the user cancelled the prompt.
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleInjectMsgBodyV1 {
    pub css: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberFieldSpecV1 {
    pub id: String,
    pub label: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliderSpecV1 {
    pub id: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepButtonsSpecV1 {
    pub down_id: String,
    pub down_label: String,
    pub up_id: String,
    pub up_label: String,
}

/// Semantic description of the control panel subtree. Layout and styling are
/// the agent's concern; the server only names the parts and their ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelSpecV1 {
    pub panel_id: String,
    pub title: String,
    pub close_id: String,
    pub close_hint: String,
    pub draggable: bool,
    pub number_field: NumberFieldSpecV1,
    pub step_buttons: StepButtonsSpecV1,
    pub slider: SliderSpecV1,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelMountMsgBodyV1 {
    pub panel: PanelSpecV1,
}

/// New values for the panel's bound fields after a rate change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelRefreshMsgBodyV1 {
    pub number_value: String,
    pub slider_value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelVisibilityMsgBodyV1 {
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSetRateMsgBodyV1 {
    pub node: u64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptShowMsgBodyV1 {
    pub message: String,
    pub initial: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertShowMsgBodyV1 {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "m")]
#[non_exhaustive]
pub enum MessageBody {
    #[serde(rename = "agent::hello/v1")]
    AgentHelloV1(AgentHelloMsgBodyV1),

    #[serde(rename = "agent::hello_ack/v1")]
    AgentHelloAckV1(AgentHelloAckMsgBodyV1),

    #[serde(rename = "agent::keepalive/v1")]
    AgentKeepaliveV1,

    #[serde(rename = "connection::client_error/v1")]
    ConnectionClientErrorV1(ConnectionClientErrorMsgBodyV1),

    #[serde(rename = "connection::closed/v1")]
    ConnectionClosedV1(ConnectionClosedMsgBodyV1),

    #[serde(rename = "document::snapshot/v1")]
    DocumentSnapshotV1(DocumentSnapshotMsgBodyV1),

    #[serde(rename = "document::mutations/v1")]
    DocumentMutationsV1(DocumentMutationsMsgBodyV1),

    #[serde(rename = "input::rate_entry/v1")]
    InputRateEntryV1(InputRateEntryMsgBodyV1),

    #[serde(rename = "input::rate_step/v1")]
    InputRateStepV1(InputRateStepMsgBodyV1),

    #[serde(rename = "input::hotkey/v1")]
    InputHotkeyV1,

    #[serde(rename = "input::panel_close/v1")]
    InputPanelCloseV1,

    #[serde(rename = "input::menu_command/v1")]
    InputMenuCommandV1,

    #[serde(rename = "input::prompt_reply/v1")]
    InputPromptReplyV1(InputPromptReplyMsgBodyV1),

    #[serde(rename = "style::inject/v1")]
    StyleInjectV1(StyleInjectMsgBodyV1),

    #[serde(rename = "panel::mount/v1")]
    PanelMountV1(PanelMountMsgBodyV1),

    #[serde(rename = "panel::refresh/v1")]
    PanelRefreshV1(PanelRefreshMsgBodyV1),

    #[serde(rename = "panel::visibility/v1")]
    PanelVisibilityV1(PanelVisibilityMsgBodyV1),

    #[serde(rename = "element::set_rate/v1")]
    ElementSetRateV1(ElementSetRateMsgBodyV1),

    #[serde(rename = "prompt::show/v1")]
    PromptShowV1(PromptShowMsgBodyV1),

    #[serde(rename = "alert::show/v1")]
    AlertShowV1(AlertShowMsgBodyV1),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "t")]
    pub timestamp: u64,

    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Self::new_with_timestamp(body, timestamp())
    }

    pub fn new_with_timestamp(body: MessageBody, timestamp: u64) -> Self {
        Self { body, timestamp }
    }
}

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
enum MessageFormat {
    Json,

    #[default]
    Msgpack,
}

/// Codec layer between the websocket and the typed protocol. The wire format
/// mirrors whatever the agent last spoke: userscript agents send JSON text
/// frames, binary-capable agents send MsgPack.
pub struct MessageChannel<S> {
    format: MessageFormat,
    ws: S,
}

impl<S> MessageChannel<S> {
    pub fn new(ws: S) -> Self {
        Self {
            format: MessageFormat::default(),
            ws,
        }
    }
}

impl<S> MessageChannel<S>
where
    S: Sink<tungstenite::Message> + Unpin,
    S::Error: Error + Send + Sync + 'static,
{
    pub async fn send(&mut self, message: Message) -> Result<(), anyhow::Error> {
        log::trace!("Sending message {message:?}");
        let serialized_msg = match self.format {
            MessageFormat::Msgpack => tungstenite::Message::Binary(
                rmp_serde::to_vec(&message).context("Failed to serialize message as MsgPack")?,
            ),
            MessageFormat::Json => tungstenite::Message::Text(
                serde_json::to_string(&message).context("Failed to serialize message as JSON")?,
            ),
        };
        self.ws
            .send(serialized_msg)
            .await
            .map_err(anyhow::Error::from)
    }

    pub async fn close(&mut self) -> Result<(), anyhow::Error> {
        self.ws.close().await?;
        Ok(())
    }
}

impl<S> MessageChannel<S>
where
    S: Stream<Item = tungstenite::Result<tungstenite::Message>> + Unpin,
{
    pub async fn recv(&mut self) -> Option<Result<Message, anyhow::Error>> {
        let msg = match self.ws.next().await? {
            Ok(msg) => msg,
            Err(err) => return Some(Err(anyhow!(err))),
        };
        let deserialized_msg: anyhow::Result<Message> = match msg {
            tungstenite::Message::Binary(data) => {
                self.format = MessageFormat::Msgpack;
                rmp_serde::from_slice(&data).map_err(|err| {
                    anyhow!(err).context("Failed to deserialize binary message as MsgPack")
                })
            }
            tungstenite::Message::Text(data) => {
                self.format = MessageFormat::Json;
                serde_json::from_str(&data).map_err(|err| {
                    anyhow!(err).context("Failed to deserialize text message as JSON")
                })
            }
            tungstenite::Message::Close(frame) => {
                log::debug!("Received close frame: {frame:?}");
                return None;
            }
            _ => return Some(Err(anyhow!("Only binary and text messages are accepted."))),
        };
        log::trace!("Received message {deserialized_msg:?}");
        Some(deserialized_msg)
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn should_send_message() {
        // given
        let mut messages = Vec::new();
        let mut channel = MessageChannel::new(&mut messages);

        // when
        channel
            .send(Message::new_with_timestamp(MessageBody::InputHotkeyV1, 69420))
            .await
            .unwrap();

        // then
        assert_eq!(messages.len(), 1);
        let tungstenite::Message::Binary(data_received) = &messages[0] else {
            panic!("Data received should be binary");
        };
        let obj_received: serde_json::Value = rmp_serde::from_slice(data_received).unwrap();

        let obj_expected = json!({
            "t": 69420,
            "m": "input::hotkey/v1",
        });
        assert_eq!(obj_received, obj_expected);
    }

    #[tokio::test]
    async fn should_receive_message() {
        // given
        let messages = vec![tungstenite::Result::Ok(tungstenite::Message::binary(
            rmp_serde::to_vec(&json!({
                "t": 42069,
                "m": "input::menu_command/v1"
            }))
            .unwrap(),
        ))];
        let mut channel = MessageChannel::new(stream::iter(messages));

        // when
        let msg = channel.recv().await.unwrap().unwrap();

        // then
        assert_eq!(
            msg,
            Message::new_with_timestamp(MessageBody::InputMenuCommandV1, 42069)
        );
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn should_mirror_the_format_the_agent_speaks() {
        // given
        let incoming = vec![tungstenite::Result::Ok(tungstenite::Message::text(
            json!({
                "t": 7,
                "m": "input::rate_entry/v1",
                "value": "2.5",
                "control": "slider",
            })
            .to_string(),
        ))];
        let mut channel = MessageChannel::new(stream::iter(incoming));

        // when
        let msg = channel.recv().await.unwrap().unwrap();

        // then
        assert_eq!(
            msg.body,
            MessageBody::InputRateEntryV1(InputRateEntryMsgBodyV1 {
                value: "2.5".to_string(),
                control: RateControlV1::Slider,
            })
        );
        assert_eq!(channel.format, MessageFormat::Json);
    }

    #[tokio::test]
    async fn should_handle_malformed_messages() {
        // given
        let messages = vec![tungstenite::Result::Ok(tungstenite::Message::binary(
            rmp_serde::to_vec(&json!({
                "t": 42069,
                "m": "input::warp_factor/v9"
            }))
            .unwrap(),
        ))];
        let mut channel = MessageChannel::new(stream::iter(messages));

        // when
        let result = channel.recv().await.unwrap();

        // then
        assert!(result.is_err());
        assert!(channel.recv().await.is_none());
    }

    #[test]
    fn should_round_trip_node_descriptions() {
        // given
        let desc = NodeDescV1 {
            id: 42,
            tag: Some("div".to_string()),
            media: None,
            children: vec![NodeDescV1 {
                id: 43,
                tag: Some("video".to_string()),
                media: Some(MediaStateV1 {
                    playback_rate: 1.0,
                    media_error: false,
                }),
                children: vec![],
            }],
        };

        // when
        let encoded = rmp_serde::to_vec(&desc).unwrap();
        let decoded: NodeDescV1 = rmp_serde::from_slice(&encoded).unwrap();

        // then
        assert_eq!(decoded, desc);
    }

    #[test]
    fn should_fill_optional_node_fields_from_sparse_json() {
        // given
        let sparse = json!({ "id": 9 }).to_string();

        // when
        let decoded: NodeDescV1 = serde_json::from_str(&sparse).unwrap();

        // then
        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.tag, None);
        assert_eq!(decoded.media, None);
        assert!(decoded.children.is_empty());
    }
}
