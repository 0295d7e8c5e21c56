use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use triago_core::clients::functions;
use triago_core::config::{AppConfig, LoadOptions};
use triago_core::steps::{FileInstructionStore, StepDefinition, TransitionTarget};

/// Function names the engine can actually dispatch. A step declaring
/// anything else would fail closed at runtime, so doctor flags it here.
const DISPATCHABLE_FUNCTIONS: [&str; 5] = [
    functions::CHECK_WARRANTY,
    functions::CREATE_TICKET,
    functions::APPEND_TICKET_NOTE,
    functions::TICKET_FEATURE_FLAG,
    functions::SEND_REPLY,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });

            let (check, definitions) = check_instruction_set(&config);
            checks.push(check);

            match definitions {
                Some(definitions) => checks.push(check_function_declarations(&definitions)),
                None => checks.push(DoctorCheck {
                    name: "function_declarations",
                    status: CheckStatus::Skipped,
                    details: "skipped because the instruction set did not load".to_string(),
                }),
            }
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.push(DoctorCheck {
                name: "instruction_set",
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            });
            checks.push(DoctorCheck {
                name: "function_declarations",
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            });
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all checks passed".to_string()
    } else {
        "doctor: one or more checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_instruction_set(config: &AppConfig) -> (DoctorCheck, Option<Vec<Arc<StepDefinition>>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return (
                DoctorCheck {
                    name: "instruction_set",
                    status: CheckStatus::Fail,
                    details: format!("failed to initialize async runtime: {error}"),
                },
                None,
            );
        }
    };

    let dir = &config.engine.instructions_dir;
    let store = match runtime.block_on(FileInstructionStore::load_dir(dir)) {
        Ok(store) => store,
        Err(error) => {
            return (
                DoctorCheck {
                    name: "instruction_set",
                    status: CheckStatus::Fail,
                    details: format!("failed to load `{}`: {error}", dir.display()),
                },
                None,
            );
        }
    };

    let definitions = store.definitions();
    if definitions.is_empty() {
        return (
            DoctorCheck {
                name: "instruction_set",
                status: CheckStatus::Fail,
                details: format!("instruction set at `{}` is empty", dir.display()),
            },
            Some(definitions),
        );
    }

    let entry_step = &config.engine.entry_step;
    if !definitions.iter().any(|definition| definition.name.as_str() == entry_step) {
        return (
            DoctorCheck {
                name: "instruction_set",
                status: CheckStatus::Fail,
                details: format!("entry step `{entry_step}` is not part of the instruction set"),
            },
            Some(definitions),
        );
    }

    let dangling = dangling_transitions(&definitions);
    if !dangling.is_empty() {
        return (
            DoctorCheck {
                name: "instruction_set",
                status: CheckStatus::Fail,
                details: format!("dangling transitions: {}", dangling.join(", ")),
            },
            Some(definitions),
        );
    }

    (
        DoctorCheck {
            name: "instruction_set",
            status: CheckStatus::Pass,
            details: format!(
                "loaded {} steps from `{}` (entry step `{entry_step}`, transitions closed)",
                definitions.len(),
                dir.display()
            ),
        },
        Some(definitions),
    )
}

fn check_function_declarations(definitions: &[Arc<StepDefinition>]) -> DoctorCheck {
    let unknown = unknown_declarations(definitions);
    if unknown.is_empty() {
        return DoctorCheck {
            name: "function_declarations",
            status: CheckStatus::Pass,
            details: "every declared function has a dispatcher handler".to_string(),
        };
    }

    DoctorCheck {
        name: "function_declarations",
        status: CheckStatus::Fail,
        details: format!("undispatchable declarations: {}", unknown.join("; ")),
    }
}

/// Step transitions that point at a step missing from the set. `DONE`
/// is always a legal target.
fn dangling_transitions(definitions: &[Arc<StepDefinition>]) -> Vec<String> {
    let known: HashSet<&str> =
        definitions.iter().map(|definition| definition.name.as_str()).collect();

    let mut dangling = Vec::new();
    for definition in definitions {
        for target in &definition.next_steps {
            if let TransitionTarget::Step(name) = target {
                if !known.contains(name.as_str()) {
                    dangling.push(format!("{} -> {}", definition.name, name));
                }
            }
        }
    }
    dangling
}

fn unknown_declarations(definitions: &[Arc<StepDefinition>]) -> Vec<String> {
    let mut unknown = Vec::new();
    for definition in definitions {
        for function in &definition.functions {
            if !DISPATCHABLE_FUNCTIONS.contains(&function.name.as_str()) {
                unknown.push(format!("step `{}` declares `{}`", definition.name, function.name));
            }
        }
    }
    unknown
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use triago_core::steps::{FunctionSpec, StepDefinition, StepName, TransitionTarget};

    use super::{
        dangling_transitions, render_human, unknown_declarations, CheckStatus, DoctorCheck,
        DoctorReport,
    };

    fn definition(name: &str, next: &[&str], functions: &[&str]) -> Arc<StepDefinition> {
        Arc::new(StepDefinition {
            name: StepName::new(name).expect("valid step name"),
            version: 1,
            description: String::new(),
            instructions: "Work the step.".to_string(),
            functions: functions
                .iter()
                .map(|name| FunctionSpec {
                    name: (*name).to_string(),
                    description: String::new(),
                    parameters: json!({ "type": "object", "properties": {} }),
                    required: Vec::new(),
                })
                .collect(),
            next_steps: next
                .iter()
                .map(|token| TransitionTarget::parse(token).expect("valid target"))
                .collect(),
            context_fields: Vec::new(),
        })
    }

    #[test]
    fn closed_transition_graph_has_no_dangling_edges() {
        let definitions = vec![
            definition("extract-identifier", &["check-warranty", "DONE"], &[]),
            definition("check-warranty", &["DONE"], &["check_warranty"]),
        ];
        assert!(dangling_transitions(&definitions).is_empty());
    }

    #[test]
    fn transition_to_missing_step_is_reported() {
        let definitions = vec![definition("extract-identifier", &["check-warranty"], &[])];
        let dangling = dangling_transitions(&definitions);
        assert_eq!(dangling, vec!["extract-identifier -> check-warranty".to_string()]);
    }

    #[test]
    fn declared_standard_functions_are_dispatchable() {
        let definitions =
            vec![definition("create-ticket", &["DONE"], &["create_ticket", "ticket_feature_flag"])];
        assert!(unknown_declarations(&definitions).is_empty());
    }

    #[test]
    fn unknown_function_declaration_is_reported() {
        let definitions = vec![definition("create-ticket", &["DONE"], &["order_pizza"])];
        let unknown = unknown_declarations(&definitions);
        assert_eq!(unknown, vec!["step `create-ticket` declares `order_pizza`".to_string()]);
    }

    #[test]
    fn human_rendering_marks_each_status() {
        let report = DoctorReport {
            overall_status: CheckStatus::Fail,
            summary: "doctor: one or more checks failed".to_string(),
            checks: vec![
                DoctorCheck {
                    name: "config_validation",
                    status: CheckStatus::Pass,
                    details: "configuration loaded and validated".to_string(),
                },
                DoctorCheck {
                    name: "instruction_set",
                    status: CheckStatus::Fail,
                    details: "instruction set at `steps` is empty".to_string(),
                },
                DoctorCheck {
                    name: "function_declarations",
                    status: CheckStatus::Skipped,
                    details: "skipped because the instruction set did not load".to_string(),
                },
            ],
        };

        let rendered = render_human(&report);
        assert!(rendered.contains("- [ok] config_validation:"));
        assert!(rendered.contains("- [fail] instruction_set:"));
        assert!(rendered.contains("- [skip] function_declarations:"));
    }
}
