// src/graph/mod.rs

//! Graph model: node and composite definitions, the per-scope dependency
//! structure, and path handles for node instances after flattening.
//!
//! Everything here is validated at construction time and immutable
//! afterwards (`DefinitionError` on violation).

pub mod composite;
pub mod definition;
pub mod dependency;
#[allow(clippy::module_inception)]
pub mod graph;
pub mod handle;
pub mod pipeline;
pub mod types;

pub use composite::{CompositeDefinition, InputMapping, OutputMapping};
pub use definition::{
    ConfigField, ConfigSchema, ConfigType, Definition, InputDefinition, NodeDefinition,
    NodeDefinitionBuilder, OutputDefinition,
};
pub use dependency::{DependencyStructure, NodeInput, NodeOutput};
pub use graph::{GraphBuilder, GraphDefinition, NodeInvocation};
pub use handle::NodeHandle;
pub use pipeline::{DEFAULT_MODE, Pipeline};
pub use types::{ANY, NOTHING, TypeCompatibility, TypeRegistry, list_item_type, list_of};
