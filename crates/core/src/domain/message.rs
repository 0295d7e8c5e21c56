use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One support email as delivered by the mailbox transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Reply composed during a run and handed to the messaging client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
}

/// Receipt returned by the messaging client for a delivered reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentReceipt {
    pub message_id: String,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::InboundMessage;

    #[test]
    fn inbound_message_round_trips_through_serde() {
        let message = InboundMessage {
            message_id: "msg-100".to_owned(),
            sender: "customer@example.com".to_owned(),
            subject: "broken unit".to_owned(),
            body: "it stopped charging".to_owned(),
            thread_id: Some("thread-7".to_owned()),
            received_at: Utc::now(),
        };

        let encoded = serde_json::to_string(&message).expect("serialize");
        let decoded: InboundMessage = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, message);
    }
}
