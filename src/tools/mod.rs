//! Tool system: declarative specs, the registry, and the policy-gated router.

pub mod builtin;
pub mod external;
pub mod registry;
pub mod router;
pub mod traits;

pub use builtin::ExecCommandTool;
pub use external::{DiscoveredTool, ExternalError, ExternalToolSource, StdioToolSource};
pub use registry::{EXTERNAL_PREFIX, ToolRegistry};
pub use router::{DEFAULT_TOOL_TIMEOUT, ToolCallOutput, ToolDispatch, ToolRouter};
pub use traits::{
    ParamField, ParamKind, ParamSpec, ToolCallContext, ToolHandler, ToolMeta, ToolSource, ToolSpec,
};
