//! Uniform predict / stream / batch surface over heterogeneous model backends,
//! with a tool-calling loop, bounded batch scheduling and queue polling.

mod adapter;
mod batch;
mod error;
mod job_poller;
mod providers;
mod stream;
mod tool_loop;
mod toolkit;
mod types;
mod usage;

pub use adapter::{
    AdapterConfig, ProviderAdapter, ResolvedConfig, COHERE_BASE_URL, DEEPSEEK_BASE_URL,
    DEFAULT_MAX_CONCURRENT, FAL_QUEUE_BASE_URL, GROQ_BASE_URL,
};
pub use batch::{AdmissionGate, AdmissionPermit, BatchScheduler};
pub use error::{PlexusError, PlexusErrorCode};
pub use job_poller::{
    AsyncJob, AsyncJobQueue, JobPoller, JobPollerConfig, JobQueue, JobStatus,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY,
};
pub use providers::{
    build_adapter, ChatAdapter, ChatCompletion, ChatWireFormat, CohereChat, CohereChatAdapter,
    FalImageAdapter, OpenAiChat, OpenAiChatAdapter, ProviderKind, FAL_CREDENTIAL_ENV,
};
pub use stream::{
    BlockingTextStream, LineBuffer, StreamAggregator, StreamDecoder, StreamRecord, TextStream,
};
pub use tool_loop::{apply_assistant_turn, render_tool_result, AssistantTurn};
pub use toolkit::{
    FunctionSchemaConverter, SchemaConverter, ToolDefinition, ToolInvokeError, ToolInvoker,
    Toolkit,
};
pub use types::{
    Conversation, Message, PredictOptions, Role, ToolCallRequest, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE,
};
pub use usage::{account, RawUsage, UsageStats};
