pub mod codec;
pub mod error;
pub mod ids;
pub mod msg;
pub mod policy;
pub mod topology;

pub use codec::{decode_batch_response, decode_topology, encode_batch_request, FrameFormat};
pub use error::{ApplicationError, ErrorCode, NodeFailure, RouterError};
pub use ids::{EndpointId, IdAllocator, OperationId, SessionId};
pub use msg::{BatchResult, BatchSlot, Method, Operation, OperationSpec, Reply};
pub use policy::{FailoverBehavior, FailoverPolicy};
pub use topology::{Endpoint, EndpointDescriptor, Role, Topology, TopologyDescriptor};
