mod edge;
mod model_graph;
mod node;
mod pair;

pub use edge::{Edge, EdgeId, EdgeKind, PropertyReference};
pub use model_graph::{InputShape, ModelGraph};
pub use node::{Node, NodeFlags, NodeId, NodeKind};
pub use pair::GraphPair;
