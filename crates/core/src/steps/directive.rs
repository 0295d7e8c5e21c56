use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::steps::definition::{InvalidStepName, TransitionTarget};

/// Marker the terminal text must end with, e.g.
/// `NEXT_STEP: create-ticket (urgent, serial_number=SN-20AB-93XK)`.
pub const DIRECTIVE_MARKER: &str = "NEXT_STEP:";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("terminal text does not end with a `NEXT_STEP:` line")]
    MarkerNotFound,
    #[error("directive names no target")]
    MissingTarget,
    #[error(transparent)]
    InvalidTarget(#[from] InvalidStepName),
    #[error("directive flag list is not terminated")]
    UnterminatedList,
    #[error("unknown directive flag `{0}`")]
    UnknownFlag(String),
    #[error("malformed directive item `{0}`")]
    MalformedItem(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DirectiveFlag {
    Escalate,
    Urgent,
    AgentDisabled,
}

impl DirectiveFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Escalate => "escalate",
            Self::Urgent => "urgent",
            Self::AgentDisabled => "agent_disabled",
        }
    }
}

impl fmt::Display for DirectiveFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DirectiveFlag {
    type Err = DirectiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "escalate" => Ok(Self::Escalate),
            "urgent" => Ok(Self::Urgent),
            "agent_disabled" => Ok(Self::AgentDisabled),
            other => Err(DirectiveError::UnknownFlag(other.to_owned())),
        }
    }
}

/// Parsed transition instruction from a step's terminal text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionDirective {
    pub target: TransitionTarget,
    pub flags: BTreeSet<DirectiveFlag>,
    /// Fields the step produced, merged into the context on transition.
    pub produced: BTreeMap<String, String>,
}

impl TransitionDirective {
    pub fn has_flag(&self, flag: DirectiveFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Extracts the directive from the final non-empty line of terminal
/// text. Anything that does not parse is an error; the engine never
/// guesses a transition.
pub fn parse_directive(text: &str) -> Result<TransitionDirective, DirectiveError> {
    let line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or(DirectiveError::MarkerNotFound)?;

    let rest = line.strip_prefix(DIRECTIVE_MARKER).ok_or(DirectiveError::MarkerNotFound)?.trim();
    if rest.is_empty() {
        return Err(DirectiveError::MissingTarget);
    }

    let (target_token, items) = match rest.split_once('(') {
        Some((head, tail)) => {
            let list = tail.trim_end();
            let list = list.strip_suffix(')').ok_or(DirectiveError::UnterminatedList)?;
            (head.trim(), Some(list))
        }
        None => (rest, None),
    };

    if target_token.is_empty() {
        return Err(DirectiveError::MissingTarget);
    }
    let target = TransitionTarget::parse(target_token)?;

    let mut flags = BTreeSet::new();
    let mut produced = BTreeMap::new();
    if let Some(items) = items {
        for item in items.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if key.is_empty() {
                        return Err(DirectiveError::MalformedItem(item.to_owned()));
                    }
                    produced.insert(key.to_owned(), value.trim().to_owned());
                }
                None => {
                    flags.insert(item.parse::<DirectiveFlag>()?);
                }
            }
        }
    }

    Ok(TransitionDirective { target, flags, produced })
}

#[cfg(test)]
mod tests {
    use crate::steps::definition::TransitionTarget;

    use super::{parse_directive, DirectiveError, DirectiveFlag};

    #[test]
    fn plain_step_directive_parses() {
        let directive = parse_directive("Looked up the serial.\n\nNEXT_STEP: check-warranty")
            .expect("directive");
        assert_eq!(directive.target.to_string(), "check-warranty");
        assert!(directive.flags.is_empty());
        assert!(directive.produced.is_empty());
    }

    #[test]
    fn done_with_flag_and_produced_field_parses() {
        let directive = parse_directive(
            "Ticket exists and the agent is switched off.\nNEXT_STEP: DONE (agent_disabled, note=ticket exists)",
        )
        .expect("directive");

        assert_eq!(directive.target, TransitionTarget::Done);
        assert!(directive.has_flag(DirectiveFlag::AgentDisabled));
        assert_eq!(directive.produced.get("note").map(String::as_str), Some("ticket exists"));
    }

    #[test]
    fn produced_serial_survives_with_surrounding_whitespace() {
        let directive =
            parse_directive("NEXT_STEP: check-warranty ( serial_number = SN-20AB-93XK )")
                .expect("directive");
        assert_eq!(
            directive.produced.get("serial_number").map(String::as_str),
            Some("SN-20AB-93XK")
        );
    }

    #[test]
    fn text_without_marker_fails_closed() {
        let error = parse_directive("I think we should create a ticket next.")
            .expect_err("no marker should fail");
        assert_eq!(error, DirectiveError::MarkerNotFound);
    }

    #[test]
    fn marker_not_on_final_line_fails_closed() {
        let error = parse_directive("NEXT_STEP: check-warranty\nActually, let me reconsider.")
            .expect_err("trailing prose should fail");
        assert_eq!(error, DirectiveError::MarkerNotFound);
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let error = parse_directive("NEXT_STEP: DONE (skip_everything)")
            .expect_err("unknown flag should fail");
        assert!(matches!(error, DirectiveError::UnknownFlag(flag) if flag == "skip_everything"));
    }

    #[test]
    fn unterminated_flag_list_is_rejected() {
        let error = parse_directive("NEXT_STEP: DONE (urgent")
            .expect_err("unterminated list should fail");
        assert_eq!(error, DirectiveError::UnterminatedList);
    }

    #[test]
    fn empty_target_is_rejected() {
        let error = parse_directive("NEXT_STEP:   ").expect_err("empty target should fail");
        assert_eq!(error, DirectiveError::MissingTarget);
    }

    #[test]
    fn uppercase_non_done_target_is_rejected() {
        let error =
            parse_directive("NEXT_STEP: CheckWarranty").expect_err("mixed case should fail");
        assert!(matches!(error, DirectiveError::InvalidTarget(_)));
    }
}
