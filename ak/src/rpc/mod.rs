//! Remote agent protocol surface (JSON-RPC over HTTP, SSE streaming)

mod messages;
mod server;

pub use messages::{
    AgentCard, JsonRpcError, JsonRpcRequest, JsonRpcResponse, MessagePart, RpcMessage, TaskRecord, TaskState,
    task_state,
};
pub use server::{RpcState, build_router, serve};
