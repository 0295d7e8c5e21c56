pub mod message;
pub mod run;
pub mod ticket;
pub mod warranty;

pub use message::{InboundMessage, OutboundReply, SentReceipt};
pub use run::{
    CallOutcome, FunctionCallRecord, ProcessingResult, RunFailure, HALT_AGENT_DISABLED,
    REASON_INCOMPLETE, REASON_REPLY_NOT_SENT,
};
pub use ticket::{NewTicket, TicketId};
pub use warranty::{WarrantyRecord, WarrantyStatus};
