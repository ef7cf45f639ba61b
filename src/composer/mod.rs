use snafu::prelude::*;

use crate::graph::WorkflowGraph;
use crate::spec::WorkflowSpec;

pub mod mistral;
pub mod native;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Workflow composition error: {message}"))]
    Composition { message: String },

    #[snafu(display("Workflow definition error: {source}"))]
    Spec { source: crate::spec::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<crate::spec::Error> for Error {
    fn from(source: crate::spec::Error) -> Self {
        Error::Spec { source }
    }
}

/// A dialect front-end: turns a workflow document into the common
/// native spec plus its composed graph. The conducting core only ever
/// sees the output of this trait and never branches on dialect.
pub trait SpecComposer: Send + Sync {
    /// Dialect name used for lookup, e.g. `native`.
    fn catalog(&self) -> &'static str;

    /// Parses a YAML document and composes its workflow graph.
    fn compose(&self, definition: &str) -> Result<(WorkflowSpec, WorkflowGraph)>;
}

static NATIVE: native::NativeComposer = native::NativeComposer;
static MISTRAL: mistral::MistralComposer = mistral::MistralComposer;

/// Looks up a registered dialect front-end by catalog name.
#[must_use]
pub fn composer_for(catalog: &str) -> Option<&'static dyn SpecComposer> {
    match catalog {
        "native" => Some(&NATIVE),
        "mistral" => Some(&MISTRAL),
        _ => None,
    }
}
