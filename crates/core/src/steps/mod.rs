pub mod definition;
pub mod directive;
pub mod store;

pub use definition::{
    FunctionSpec, InvalidStepName, StepDefinition, StepName, TransitionTarget, DONE_SENTINEL,
};
pub use directive::{
    parse_directive, DirectiveError, DirectiveFlag, TransitionDirective, DIRECTIVE_MARKER,
};
pub use store::{
    parse_step_file, FileInstructionStore, InMemoryInstructionStore, InstructionStore,
    StepStoreError,
};
