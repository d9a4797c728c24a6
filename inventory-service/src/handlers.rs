use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset};
use std::time::Duration;
use tokio::time;
use uuid::Uuid;
use tracing::{error, info, warn};
use shared::*;
use crate::engine::StockEngine;
use crate::error::{ReleaseError, ReserveError};
use crate::models::{ProcessedCommand, Reservation};
use crate::release::ReleaseSummary;
use crate::schema::*;
use crate::DbPool;

pub struct CommandHandler {
    pool: DbPool,
    engine: StockEngine,
    producer: FutureProducer,
    reply_topic: String,
    retry_backoff: Duration,
}

/// What to do with a consumed message once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The outcome is final and the reply went out; move past the message.
    Commit,
    /// Leave the offset where it is so the command is consumed again.
    Redeliver,
}

impl CommandHandler {
    pub fn new(
        pool: DbPool,
        engine: StockEngine,
        producer: FutureProducer,
        reply_topic: String,
        retry_backoff: Duration,
    ) -> Self {
        Self { pool, engine, producer, reply_topic, retry_backoff }
    }

    /// Consumes commands one at a time. Offsets are committed by hand, only for
    /// messages whose outcome is final.
    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            let m = match message {
                Ok(m) => m,
                Err(e) => {
                    error!("Error receiving message: {}", e);
                    continue;
                }
            };

            let delivery = match m.payload_view::<str>() {
                Some(Ok(json_str)) => self.handle_payload(json_str).await,
                Some(Err(e)) => {
                    warn!(offset = m.offset(), "Skipping non-UTF-8 payload: {}", e);
                    Delivery::Commit
                }
                None => Delivery::Commit,
            };

            match delivery {
                Delivery::Commit => {
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Delivery::Redeliver => {
                    warn!(partition = m.partition(), offset = m.offset(), "Command will be redelivered");
                    if let Err(e) = consumer.seek(m.topic(), m.partition(), Offset::Offset(m.offset()), Duration::from_secs(5)) {
                        error!("Error rewinding to offset {}: {}", m.offset(), e);
                    }
                    time::sleep(self.retry_backoff).await;
                }
            }
        }
    }

    async fn handle_payload(&self, json_str: &str) -> Delivery {
        let command = match serde_json::from_str::<Command>(json_str) {
            Ok(command) => command,
            Err(e) => {
                warn!("Malformed command: {}", e);
                return match malformed_reply(json_str, &e) {
                    Some(reply) => match self.send_reply(reply).await {
                        Ok(()) => Delivery::Commit,
                        Err(e) => {
                            error!("Error replying to malformed command: {}", e);
                            Delivery::Redeliver
                        }
                    },
                    None => Delivery::Commit,
                };
            }
        };

        let command_id = command.id;
        match self.handle_command(command).await {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(%command_id, "Error handling command: {}", e);
                Delivery::Redeliver
            }
        }
    }

    async fn handle_command(&self, command: Command) -> Result<Delivery> {
        let mut conn = self.pool.get().await?;

        if let Some(existing) = self.check_idempotency(&mut conn, &command.idempotency_key).await? {
            info!(key = %command.idempotency_key, "Command already processed, returning recorded reply");
            let reply: CommandReply = serde_json::from_value(existing.reply)?;
            self.send_reply(reply).await?;
            return Ok(Delivery::Commit);
        }
        // The engine checks out its own connections.
        drop(conn);

        let reply = match command.command_type {
            CommandType::ReserveStock => self.handle_reserve_stock(&command).await,
            CommandType::ReleaseStock => self.handle_release_stock(&command, false).await,
            CommandType::CancelReservation => self.handle_release_stock(&command, true).await,
        };

        // Retryable failures are neither recorded nor answered; the redelivery
        // runs the engine again.
        if delivery_for(&reply) == Delivery::Redeliver {
            warn!(command_id = %command.id, error = ?reply.error, "Retryable failure");
            return Ok(Delivery::Redeliver);
        }

        let recorded = match self.pool.get().await {
            Ok(mut conn) => self.store_processed_command(&mut conn, &command, &reply).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = recorded {
            // Without a record the redelivery would reserve a second time.
            if let Some(order_id) = reservation_to_undo(&command, &reply) {
                self.undo_reservation(order_id).await;
            }
            return Err(e);
        }

        self.send_reply(reply).await?;
        Ok(Delivery::Commit)
    }

    async fn undo_reservation(&self, order_id: Uuid) {
        match self.engine.cancel_reservation(order_id).await {
            Ok(summary) => info!(%order_id, rows = summary.reservations.len(), "Unrecorded reservation cancelled"),
            Err(e) => error!(
                target: "reconciliation",
                %order_id,
                "Reservation is held but its command was not recorded: {}", e
            ),
        }
    }

    async fn handle_reserve_stock(&self, command: &Command) -> CommandReply {
        let data: ReserveStockData = match serde_json::from_value(command.payload.clone()) {
            Ok(data) => data,
            Err(e) => return invalid_payload(command, e),
        };
        let result = self.engine.reserve_stock(data.order_id, &data.items).await;
        reserve_reply(command, result)
    }

    async fn handle_release_stock(&self, command: &Command, cancel: bool) -> CommandReply {
        let data: ReleaseStockData = match serde_json::from_value(command.payload.clone()) {
            Ok(data) => data,
            Err(e) => return invalid_payload(command, e),
        };
        let result = if cancel {
            self.engine.cancel_reservation(data.order_id).await
        } else {
            self.engine.release_stock(data.order_id).await
        };
        release_reply(command, result)
    }

    async fn check_idempotency(&self, conn: &mut AsyncPgConnection, key: &str) -> Result<Option<ProcessedCommand>> {
        let result = processed_commands::table
            .filter(processed_commands::idempotency_key.eq(key))
            .first::<ProcessedCommand>(conn)
            .await
            .optional()?;
        Ok(result)
    }

    async fn store_processed_command(&self, conn: &mut AsyncPgConnection, command: &Command, reply: &CommandReply) -> Result<()> {
        let processed_command = ProcessedCommand {
            idempotency_key: command.idempotency_key.clone(),
            command_id: command.id,
            reply: serde_json::to_value(reply)?,
            processed_at: chrono::Utc::now(),
        };

        diesel::insert_into(processed_commands::table)
            .values(&processed_command)
            .on_conflict_do_nothing()
            .execute(conn)
            .await?;

        Ok(())
    }

    async fn send_reply(&self, reply: CommandReply) -> Result<()> {
        let json = serde_json::to_string(&reply)?;
        let key = reply.saga_id.to_string();
        let record = FutureRecord::to(&self.reply_topic)
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to send reply: {}", e))?;

        Ok(())
    }
}

/// Retryable outcomes are redelivered; everything else is final.
pub fn delivery_for(reply: &CommandReply) -> Delivery {
    if reply.reason.map_or(false, |reason| reason.is_retryable()) {
        Delivery::Redeliver
    } else {
        Delivery::Commit
    }
}

/// Order whose fresh reservation must be cancelled when the reply could not be
/// recorded.
pub fn reservation_to_undo(command: &Command, reply: &CommandReply) -> Option<Uuid> {
    if command.command_type != CommandType::ReserveStock || reply.status != CommandStatus::Success {
        return None;
    }
    serde_json::from_value::<ReserveStockData>(command.payload.clone())
        .ok()
        .map(|data| data.order_id)
}

/// A failed reply for a message that is not a valid `Command`, when it still
/// names the saga to answer.
pub fn malformed_reply(json_str: &str, err: &serde_json::Error) -> Option<CommandReply> {
    let value: serde_json::Value = serde_json::from_str(json_str).ok()?;
    let saga_id: Uuid = serde_json::from_value(value.get("saga_id")?.clone()).ok()?;
    let command_id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<Uuid>(id.clone()).ok())
        .unwrap_or_else(Uuid::nil);
    Some(CommandReply::failed(command_id, saga_id, FailureReason::InvalidRequest, err.to_string()))
}

fn invalid_payload(command: &Command, e: serde_json::Error) -> CommandReply {
    warn!(command_id = %command.id, "Invalid payload: {}", e);
    CommandReply::failed(command.id, command.saga_id, FailureReason::InvalidRequest, e.to_string())
}

pub fn reserve_reply(command: &Command, result: Result<Vec<Reservation>, ReserveError>) -> CommandReply {
    match result {
        Ok(reservations) => CommandReply::success(
            command.id,
            command.saga_id,
            Some(serde_json::json!({ "reserved": true, "reservations": reservations })),
        ),
        Err(e) => CommandReply::failed(command.id, command.saga_id, e.reason(), e.to_string()),
    }
}

pub fn release_reply(command: &Command, result: Result<ReleaseSummary, ReleaseError>) -> CommandReply {
    match result {
        Ok(summary) => CommandReply::success(
            command.id,
            command.saga_id,
            Some(serde_json::json!({ "released": true, "summary": summary })),
        ),
        Err(e) => CommandReply::failed(command.id, command.saga_id, e.reason(), e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    fn release_command(order_id: Uuid) -> Command {
        Command::release_stock(Uuid::new_v4(), &ReleaseStockData { order_id }).unwrap()
    }

    #[test]
    fn insufficient_stock_is_a_final_failure() {
        let command = release_command(Uuid::new_v4());
        let reply = reserve_reply(
            &command,
            Err(ReserveError::InsufficientStock { variant_id: Uuid::new_v4(), requested: 4 }),
        );

        assert_eq!(reply.status, CommandStatus::Failed);
        assert_eq!(reply.reason, Some(FailureReason::InsufficientStock));
        assert!(!reply.reason.unwrap().is_retryable());
    }

    #[test]
    fn already_released_is_distinct_from_never_reserved() {
        let order = Uuid::new_v4();
        let command = release_command(order);

        let again = release_reply(&command, Err(ReleaseError::NoReservedStockFound(order)));
        let never = release_reply(&command, Err(ReleaseError::NoReservationsFound(order)));

        assert_eq!(again.reason, Some(FailureReason::NoReservedStockFound));
        assert_eq!(never.reason, Some(FailureReason::NoReservationsFound));
    }

    #[test]
    fn storage_failure_is_retryable() {
        let command = release_command(Uuid::new_v4());
        let reply = release_reply(
            &command,
            Err(ReleaseError::Infrastructure(StorageError::Unavailable("ledger".to_string()))),
        );

        assert_eq!(reply.reason, Some(FailureReason::Infrastructure));
        assert!(reply.reason.unwrap().is_retryable());
        assert_eq!(reply.command_id, command.id);
        assert_eq!(reply.saga_id, command.saga_id);
    }

    #[test]
    fn only_retryable_failures_are_redelivered() {
        let command = release_command(Uuid::new_v4());
        let done = release_reply(&command, Err(ReleaseError::NoReservedStockFound(Uuid::new_v4())));
        let down = release_reply(
            &command,
            Err(ReleaseError::Infrastructure(StorageError::Unavailable("ledger".to_string()))),
        );
        let ok = CommandReply::success(command.id, command.saga_id, None);

        assert_eq!(delivery_for(&done), Delivery::Commit);
        assert_eq!(delivery_for(&ok), Delivery::Commit);
        assert_eq!(delivery_for(&down), Delivery::Redeliver);
    }

    #[test]
    fn successful_reserve_is_undone_when_unrecorded() {
        let order_id = Uuid::new_v4();
        let data = ReserveStockData {
            order_id,
            items: vec![LineItem { variant_id: Uuid::new_v4(), quantity: 1 }],
        };
        let reserve = Command::reserve_stock(Uuid::new_v4(), &data).unwrap();
        let ok = reserve_reply(&reserve, Ok(Vec::new()));
        let short = reserve_reply(
            &reserve,
            Err(ReserveError::InsufficientStock { variant_id: Uuid::new_v4(), requested: 1 }),
        );

        assert_eq!(reservation_to_undo(&reserve, &ok), Some(order_id));
        assert_eq!(reservation_to_undo(&reserve, &short), None);

        let release = release_command(order_id);
        let released = CommandReply::success(release.id, release.saga_id, None);
        assert_eq!(reservation_to_undo(&release, &released), None);
    }

    #[test]
    fn unknown_command_type_is_answered_when_saga_is_known() {
        let saga_id = Uuid::new_v4();
        let command_id = Uuid::new_v4();
        let json = serde_json::json!({
            "id": command_id,
            "saga_id": saga_id,
            "command_type": "ShipOrder",
            "payload": {},
            "idempotency_key": "k",
            "created_at": chrono::Utc::now(),
        })
        .to_string();
        let err = serde_json::from_str::<Command>(&json).unwrap_err();

        let reply = malformed_reply(&json, &err).unwrap();
        assert_eq!(reply.saga_id, saga_id);
        assert_eq!(reply.command_id, command_id);
        assert_eq!(reply.reason, Some(FailureReason::InvalidRequest));

        let anonymous = r#"{"command_type": "ShipOrder"}"#;
        let err = serde_json::from_str::<Command>(anonymous).unwrap_err();
        assert!(malformed_reply(anonymous, &err).is_none());
        assert!(malformed_reply("not json", &err).is_none());
    }
}
