//! Hub wire frames
//!
//! One JSON object per line, tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use tabmesh_core::Identity;

use crate::TransportResult;

/// A tab known to the broker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub identity: Identity,
    /// Broker clock at first registration (ms)
    pub joined_at: u64,
}

impl TabInfo {
    #[inline]
    pub fn tab_id(&self) -> &str {
        self.identity.tab_id.as_str()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    // Session
    Register { identity: Identity },
    /// Handshake reply with the other currently known tabs
    Registered { tabs: Vec<TabInfo> },
    Unregister,
    Heartbeat,
    HeartbeatAck,

    // Routing
    /// A serialized envelope, opaque to the broker
    Message { payload: Value },
    TabJoined { tab: TabInfo },
    TabLeft { tab_id: String },

    // Shared state
    GetState { request_id: String, key: String },
    StateValue {
        request_id: String,
        key: String,
        #[serde(default)]
        value: Option<Value>,
    },
    SetState { key: String, value: Value },

    Error { message: String },
}

impl HubFrame {
    pub fn decode(line: &str) -> TransportResult<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Encode as a single newline-terminated line
    pub fn encode_line(&self) -> TransportResult<Vec<u8>> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(b'\n');
        Ok(buf)
    }

    pub(crate) async fn write_to<W>(&self, writer: &mut W) -> TransportResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode_line()?).await?;
        writer.flush().await?;
        Ok(())
    }
}
