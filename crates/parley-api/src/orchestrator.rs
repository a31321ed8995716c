use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use parley_gateway::dispatcher::Dispatcher;
use parley_types::events::GatewayEvent;
use parley_types::models::{Message, MessageDraft, MessageKind};
use parley_types::ports::{
    BackendError, ChatAccess, Debit, MessageStore, RateDecision, RateLimit, Unlocked, Wallet,
};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("sender is not a participant of the chat")]
    Forbidden,

    #[error("message not found")]
    NotFound,

    #[error("invalid message: {0}")]
    Invalid(String),

    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: i64, required: i64 },

    #[error("backend failure: {0}")]
    Backend(String),
}

impl From<BackendError> for SendError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound => Self::NotFound,
            BackendError::Unavailable(msg) => Self::Backend(msg),
        }
    }
}

/// The canonical message plus the caller's balance after the operation.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message: Message,
    pub balance: i64,
}

/// Runs every outgoing message through access, validation, rate limiting and
/// billing before it reaches the store, then fans it out to the gateway.
#[derive(Clone)]
pub struct SendOrchestrator {
    store: Arc<dyn MessageStore>,
    access: Arc<dyn ChatAccess>,
    wallet: Arc<dyn Wallet>,
    limiter: Arc<dyn RateLimit>,
    dispatcher: Dispatcher,
}

impl SendOrchestrator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        access: Arc<dyn ChatAccess>,
        wallet: Arc<dyn Wallet>,
        limiter: Arc<dyn RateLimit>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            access,
            wallet,
            limiter,
            dispatcher,
        }
    }

    /// Send a message. Nothing is persisted unless the sender has been
    /// charged, and a charge is refunded if the insert fails.
    pub async fn send(
        &self,
        chat_id: &str,
        sender_id: &str,
        draft: MessageDraft,
    ) -> Result<SendReceipt, SendError> {
        if !self.access.is_participant(chat_id, sender_id).await? {
            return Err(SendError::Forbidden);
        }

        draft.validate().map_err(SendError::Invalid)?;

        if let RateDecision::Limited { reset_at } = self.limiter.check(sender_id).await {
            debug!("{} rate limited in {}", sender_id, chat_id);
            return Err(SendError::RateLimited { reset_at });
        }

        let cost = draft.kind.send_cost();
        let balance = if cost > 0 {
            let description = format!("send {} in {}", draft.kind, chat_id);
            match self.wallet.debit(sender_id, cost, &description).await? {
                Debit::Applied { new_balance } => new_balance,
                Debit::Insufficient { balance } => {
                    return Err(SendError::InsufficientBalance {
                        balance,
                        required: cost,
                    });
                }
            }
        } else {
            self.wallet.balance(sender_id).await?
        };

        let message = match self.store.insert(draft.into_new_message(chat_id, sender_id)).await {
            Ok(message) => message,
            Err(e) => {
                if cost > 0 {
                    self.refund(sender_id, cost, chat_id).await;
                }
                return Err(SendError::Backend(e.to_string()));
            }
        };

        info!("{} sent {} {} in {}", sender_id, message.kind, message.id, chat_id);
        self.dispatcher.publish(GatewayEvent::MessageInsert {
            message: message.clone(),
        });

        Ok(SendReceipt { message, balance })
    }

    /// Unlock paid media for `viewer_id`. The viewer pays the price and the
    /// sender receives it; senders and repeat viewers pay nothing.
    pub async fn unlock(
        &self,
        chat_id: &str,
        message_id: &str,
        viewer_id: &str,
    ) -> Result<SendReceipt, SendError> {
        if !self.access.is_participant(chat_id, viewer_id).await? {
            return Err(SendError::Forbidden);
        }

        let message = self.store.get(message_id).await?;
        if message.chat_id != chat_id {
            return Err(SendError::NotFound);
        }
        if message.kind != MessageKind::PaidMedia {
            return Err(SendError::Invalid("only paid media can be unlocked".into()));
        }
        if message.is_unlocked_for(viewer_id) {
            let balance = self.wallet.balance(viewer_id).await?;
            return Ok(SendReceipt { message, balance });
        }

        let price = message.price.unwrap_or(0);
        let description = format!("unlock {}", message.id);
        let balance = match self.wallet.debit(viewer_id, price, &description).await? {
            Debit::Applied { new_balance } => new_balance,
            Debit::Insufficient { balance } => {
                return Err(SendError::InsufficientBalance {
                    balance,
                    required: price,
                });
            }
        };

        let message = match self.store.append_unlock(message_id, viewer_id).await {
            Ok(Unlocked {
                message,
                inserted: true,
            }) => message,
            Ok(Unlocked { message, .. }) => {
                // A concurrent unlock by the same viewer got there first.
                debug!("{} already unlocked {}, refunding", viewer_id, message.id);
                let description = format!("refund duplicate unlock {}", message.id);
                let balance = self.wallet.credit(viewer_id, price, &description).await?;
                return Ok(SendReceipt { message, balance });
            }
            Err(e) => {
                self.refund(viewer_id, price, chat_id).await;
                return Err(SendError::Backend(e.to_string()));
            }
        };

        let payout = format!("unlock payout {}", message.id);
        if let Err(e) = self.wallet.credit(&message.sender_id, price, &payout).await {
            warn!("Payout of {} to {} failed: {}", price, message.sender_id, e);
        }

        info!("{} unlocked {} for {}", viewer_id, message.id, price);
        Ok(SendReceipt { message, balance })
    }

    async fn refund(&self, user_id: &str, amount: i64, chat_id: &str) {
        let description = format!("refund failed send in {}", chat_id);
        if let Err(e) = self.wallet.credit(user_id, amount, &description).await {
            warn!("Refund of {} to {} failed: {}", amount, user_id, e);
        }
    }
}
