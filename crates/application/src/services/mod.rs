pub mod history;
pub mod send_message;

pub use history::MessageHistoryService;
pub use send_message::{SendMessageCommand, SendMessageDependencies, SendMessageUseCase};
