pub mod graph;
pub mod run;
pub mod validate;

pub use graph::{GraphArgs, handle_graph};
pub use run::{RunArgs, handle_run};
pub use validate::{ValidateArgs, handle_validate};
