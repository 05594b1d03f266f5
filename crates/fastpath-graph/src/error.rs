//! Graph construction errors

use crate::element::ElementId;
use thiserror::Error;

/// Build-time graph errors. None of these can occur once the graph is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Topology is frozen after a successful `validate()`
    #[error("graph is sealed")]
    GraphSealed,

    #[error("graph already holds {0} elements")]
    TooManyElements(usize),

    #[error("element {class} declares {outputs} outputs (max {max})")]
    TooManyOutputs {
        class: &'static str,
        outputs: usize,
        max: usize,
    },

    #[error("no element {0}")]
    InvalidElement(ElementId),

    #[error("element {element} has no output port {port}")]
    InvalidOutputPort { element: ElementId, port: usize },

    #[error("element {element} has no input port {port}")]
    InvalidInputPort { element: ElementId, port: usize },

    #[error("output port {port} of element {element} is already linked")]
    PortAlreadyLinked { element: ElementId, port: usize },

    #[error("linking {from} -> {to} would close a cycle")]
    CycleDetected { from: ElementId, to: ElementId },

    #[error("element {element} reads annotation {annotation} that nothing upstream writes")]
    UnsatisfiedAnnotation { element: ElementId, annotation: usize },

    #[error("element {class} targets coprocessor type {device_type} (max {max})")]
    InvalidDeviceType {
        class: &'static str,
        device_type: usize,
        max: usize,
    },

    /// No schedulable element to feed the graph
    #[error("graph has no entry point")]
    NoEntryPoint,
}

/// Result type for graph construction
pub type GraphResult<T> = Result<T, GraphError>;
