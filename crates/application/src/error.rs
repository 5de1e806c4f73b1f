use domain::{DomainError, MessageId, RepositoryError};
use thiserror::Error;

use crate::broker::BrokerError;
use crate::id_generator::IdGeneratorError;
use crate::presence::PresenceError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    /// 存储查询失败
    #[error("query failed: {0}")]
    Repository(#[from] RepositoryError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("presence error: {0}")]
    Presence(#[from] PresenceError),
    #[error("id generator error: {0}")]
    IdGenerator(#[from] IdGeneratorError),
    /// 消息已落库但没有投递到消息代理，只能通过历史查询拿到
    #[error("message {message_id} stored but not published: {source}")]
    PublishAfterStore {
        message_id: MessageId,
        #[source]
        source: BrokerError,
    },
}

impl ApplicationError {
    /// 是否是调用方输入导致的错误
    pub fn is_client_error(&self) -> bool {
        matches!(self, ApplicationError::Domain(_))
    }
}
