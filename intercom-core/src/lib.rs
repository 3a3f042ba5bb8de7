pub mod agent;
pub mod config;
pub mod ipc;
pub mod store;

pub use agent::{
    AgentInput, AgentOutput, AgentStatus, OUTPUT_END_MARKER, OUTPUT_START_MARKER,
    extract_output_markers,
};
pub use config::{AgentConfig, IntercomConfig, OrchestratorConfig, SchedulerConfig, load_config};
pub use ipc::{
    IpcGroupContext, IpcMessage, IpcTask, is_valid_folder_name, is_valid_group_name, is_valid_jid,
};
pub use store::{
    ChatInfo, ConversationMessage, NewMessage, RegisteredGroup, ScheduledTask, Store, TaskRunLog,
    TaskStatus, TaskUpdate, now_iso,
};
