pub mod autogroup;
pub mod builder;
pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod path;
pub mod payload;
pub mod tree;
pub mod visibility;
pub mod zoom;

pub use builder::{Indicator, Vital};
pub use config::Config;
pub use error::{ApiError, Result, TraceTreeError};
pub use events::TraceTreeEvent;
pub use node::{FetchStatus, NodeId, NodeValue, Space, TraceTreeNode};
pub use path::PathSegment;
pub use payload::{EventTransaction, TraceMetadata, TracePayload};
pub use tree::TraceTree;
pub use visibility::{NodeSnapshot, Row};
pub use zoom::{RequestState, SpanRequest, TraceApiClient, ZoomContext};
