use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

use crate::clients::functions;
use crate::domain::{InboundMessage, TicketId, WarrantyRecord};

/// Mutable state of one run. Only the orchestrator writes to it; steps
/// observe it through the narrowed projection they declared.
#[derive(Clone, Debug)]
pub struct ProcessingContext {
    pub correlation_id: Uuid,
    pub message: InboundMessage,
    pub serial_number: Option<String>,
    pub warranty: Option<WarrantyRecord>,
    pub ticket_id: Option<TicketId>,
    /// Step-produced fields with no typed slot.
    pub vars: BTreeMap<String, String>,
}

impl ProcessingContext {
    pub fn for_message(message: InboundMessage) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            message,
            serial_number: None,
            warranty: None,
            ticket_id: None,
            vars: BTreeMap::new(),
        }
    }

    /// Resolves one context field by key. Typed fields win over the
    /// free-form bag; absent fields are `None`, never empty strings.
    pub fn field(&self, key: &str) -> Option<String> {
        match key {
            "message_id" => Some(self.message.message_id.clone()),
            "sender" => Some(self.message.sender.clone()),
            "subject" => Some(self.message.subject.clone()),
            "body" => Some(self.message.body.clone()),
            "thread_id" => self.message.thread_id.clone(),
            "received_at" => Some(self.message.received_at.to_rfc3339()),
            "serial_number" => self.serial_number.clone(),
            "warranty_status" => {
                self.warranty.as_ref().map(|record| record.status.as_str().to_owned())
            }
            "warranty_expires_at" => self
                .warranty
                .as_ref()
                .and_then(|record| record.expires_at)
                .map(|expires| expires.to_rfc3339()),
            "repair_window_hours" => self
                .warranty
                .as_ref()
                .and_then(|record| record.repair_window_hours)
                .map(|hours| hours.to_string()),
            "repair_urgent" => {
                self.warranty.as_ref().map(|record| record.repair_urgent().to_string())
            }
            "ticket_id" => self.ticket_id.map(|id| id.canonical().to_string()),
            other => self.vars.get(other).cloned(),
        }
    }

    /// Projects the context onto a step's allow-list. Fields outside the
    /// list never reach the step, and unknown or unset keys are simply
    /// absent.
    pub fn narrow(&self, allowed: &[String]) -> BTreeMap<String, String> {
        let mut projection = BTreeMap::new();
        for key in allowed {
            if let Some(value) = self.field(key) {
                projection.insert(key.clone(), value);
            }
        }
        projection
    }

    /// Merges a step-produced field. Known keys land in their typed
    /// slot; the rest go to the bag.
    pub fn record_produced(&mut self, key: &str, value: &str) {
        match key {
            "serial_number" => self.serial_number = Some(value.to_owned()),
            "ticket_id" => {
                if let Ok(id) = value.parse::<i64>() {
                    self.ticket_id = Some(TicketId(id));
                } else {
                    self.vars.insert(key.to_owned(), value.to_owned());
                }
            }
            _ => {
                self.vars.insert(key.to_owned(), value.to_owned());
            }
        }
    }

    /// Applies the typed payload of a successful function call.
    pub fn absorb_function_result(&mut self, function: &str, result: &Value) {
        match function {
            functions::CHECK_WARRANTY => {
                if let Ok(record) = serde_json::from_value::<WarrantyRecord>(result.clone()) {
                    self.warranty = Some(record);
                }
            }
            functions::CREATE_TICKET => {
                if let Some(id) = result.get("ticket_id").and_then(Value::as_i64) {
                    self.ticket_id = Some(TicketId(id));
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use crate::domain::{InboundMessage, TicketId};

    use super::ProcessingContext;

    fn context() -> ProcessingContext {
        ProcessingContext::for_message(InboundMessage {
            message_id: "msg-1".to_owned(),
            sender: "customer@example.com".to_owned(),
            subject: "charger died".to_owned(),
            body: "serial is SN-20AB-93XK, unit will not charge".to_owned(),
            thread_id: None,
            received_at: Utc::now(),
        })
    }

    #[test]
    fn narrowing_keeps_only_allow_listed_fields() {
        let mut context = context();
        context.serial_number = Some("SN-20AB-93XK".to_owned());

        let narrowed =
            context.narrow(&["sender".to_owned(), "serial_number".to_owned()]);

        assert_eq!(narrowed.len(), 2);
        assert_eq!(narrowed.get("sender").map(String::as_str), Some("customer@example.com"));
        assert_eq!(narrowed.get("serial_number").map(String::as_str), Some("SN-20AB-93XK"));
        assert!(!narrowed.contains_key("body"));
    }

    #[test]
    fn unset_and_unknown_fields_are_absent_from_projection() {
        let context = context();
        let narrowed = context.narrow(&[
            "serial_number".to_owned(),
            "thread_id".to_owned(),
            "favourite_colour".to_owned(),
        ]);
        assert!(narrowed.is_empty());
    }

    #[test]
    fn produced_serial_lands_in_typed_slot() {
        let mut context = context();
        context.record_produced("serial_number", "SN-20AB-93XK");
        context.record_produced("note", "customer is patient");

        assert_eq!(context.serial_number.as_deref(), Some("SN-20AB-93XK"));
        assert_eq!(context.vars.get("note").map(String::as_str), Some("customer is patient"));
    }

    #[test]
    fn warranty_result_is_absorbed_into_typed_fields() {
        let mut context = context();
        context.absorb_function_result(
            "check_warranty",
            &json!({ "status": "valid", "repair_window_hours": 24 }),
        );

        let record = context.warranty.as_ref().expect("warranty absorbed");
        assert_eq!(record.repair_window_hours, Some(24));
        assert_eq!(context.field("repair_urgent").as_deref(), Some("true"));
    }

    #[test]
    fn ticket_result_exposes_canonical_id() {
        let mut context = context();
        context.absorb_function_result("create_ticket", &json!({ "ticket_id": -4182 }));

        assert_eq!(context.ticket_id, Some(TicketId(-4182)));
        assert_eq!(context.field("ticket_id").as_deref(), Some("4182"));
    }
}
