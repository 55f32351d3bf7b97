//! Demo money-transfer services run by the `spool` binary.
//!
//! Account keys drive failure injection: a key starting with `9` is
//! unavailable (terminal), one starting with `8` fails transiently most of
//! the time, and an amount of 1337 cents never parses.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use spool_core::{
    Context, HandlerError, IdempotencyToken, InvocationTarget, ResolveOutcome, ServiceDefinition,
    handler_fn,
};
use tracing::info;

pub const INITIAL_BALANCE: u64 = 100_000;
pub const APPROVAL_THRESHOLD: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub from: String,
    pub to: String,
    pub cents: u64,
}

async fn demo_failures(ctx: &Context, cents: u64) -> Result<(), HandlerError> {
    if cents == 1337 {
        return Err(HandlerError::transient("Parse error"));
    }
    let key = ctx.key().unwrap_or_default();
    if key.starts_with('9') {
        return Err(HandlerError::terminal("Account unavailable"));
    }
    if key.starts_with('8') {
        // The coin is journaled, so a replay never flips it again.
        ctx.run("link", || async {
            if rand::thread_rng().gen_bool(0.66) {
                return Err(HandlerError::transient("Temporary error"));
            }
            Ok(())
        })
        .await?;
    }
    Ok(())
}

async fn deposit(ctx: Context, cents: u64) -> Result<(), HandlerError> {
    demo_failures(&ctx, cents).await?;
    let balance: u64 = ctx.get_state("balance")?.unwrap_or(INITIAL_BALANCE);
    ctx.set_state("balance", &(balance + cents))?;
    info!(account = ctx.key(), cents, "deposit");
    Ok(())
}

async fn withdraw(ctx: Context, cents: u64) -> Result<bool, HandlerError> {
    demo_failures(&ctx, cents).await?;
    let balance: u64 = ctx.get_state("balance")?.unwrap_or(INITIAL_BALANCE);
    if balance < cents {
        info!(account = ctx.key(), cents, balance, "withdraw refused");
        return Ok(false);
    }
    ctx.set_state("balance", &(balance - cents))?;
    info!(account = ctx.key(), cents, "withdraw");
    Ok(true)
}

async fn balance(ctx: Context, _: ()) -> Result<u64, HandlerError> {
    Ok(ctx.get_state("balance")?.unwrap_or(INITIAL_BALANCE))
}

pub fn account() -> ServiceDefinition {
    ServiceDefinition::virtual_object("account")
        .handler("deposit", handler_fn(deposit))
        .handler("withdraw", handler_fn(withdraw))
        .shared("balance", handler_fn(balance))
}

fn account_target(handler: &str, key: &str) -> InvocationTarget {
    InvocationTarget::keyed("account", handler, key)
}

async fn journaled_token(ctx: &Context) -> Result<IdempotencyToken, HandlerError> {
    ctx.run("token", || async { Ok(IdempotencyToken::generate()) })
        .await
}

async fn refund(ctx: &Context, transfer: &Transfer) -> Result<(), HandlerError> {
    let token = ctx.deterministic_token();
    ctx.call(&account_target("deposit", &transfer.from), &token, &transfer.cents)
        .await
}

/// Withdraw then deposit under one token. A deposit that fails terminally is
/// refunded to the source.
async fn move_money(ctx: Context, transfer: Transfer) -> Result<bool, HandlerError> {
    let token = journaled_token(&ctx).await?;
    let withdrawn: bool = ctx
        .call(&account_target("withdraw", &transfer.from), &token, &transfer.cents)
        .await?;
    if !withdrawn {
        return Ok(false);
    }
    match ctx
        .call::<_, ()>(&account_target("deposit", &transfer.to), &token, &transfer.cents)
        .await
    {
        Ok(()) => Ok(true),
        Err(e) => {
            e.into_terminal()?;
            refund(&ctx, &transfer).await?;
            Ok(false)
        }
    }
}

pub fn transfer_service() -> ServiceDefinition {
    ServiceDefinition::service("transfer").handler("transfer", handler_fn(move_money))
}

/// A failed deposit is tried once more a day later; only then is the source
/// refunded.
async fn transfer_with_retry(ctx: Context, transfer: Transfer) -> Result<bool, HandlerError> {
    let token = journaled_token(&ctx).await?;
    let withdrawn: bool = ctx
        .call(&account_target("withdraw", &transfer.from), &token, &transfer.cents)
        .await?;
    if !withdrawn {
        return Ok(false);
    }

    let deposit = account_target("deposit", &transfer.to);
    let Err(e) = ctx.call::<_, ()>(&deposit, &token, &transfer.cents).await else {
        return Ok(true);
    };
    let first = e.into_terminal()?;
    info!(to = %transfer.to, error = %first, "deposit failed, retrying tomorrow");

    ctx.sleep(Duration::from_secs(24 * 3600)).await?;
    let retry_token = ctx.deterministic_token();
    match ctx.call::<_, ()>(&deposit, &retry_token, &transfer.cents).await {
        Ok(()) => Ok(true),
        Err(e) => {
            e.into_terminal()?;
            refund(&ctx, &transfer).await?;
            Ok(false)
        }
    }
}

pub fn txn_service() -> ServiceDefinition {
    ServiceDefinition::service("txn").handler("transfer", handler_fn(transfer_with_retry))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum PaymentStatus {
    New,
    CompletedBefore,
    Cancelled,
    Failed,
}

impl PaymentStatus {
    fn label(self) -> &'static str {
        match self {
            PaymentStatus::New => "NEW",
            PaymentStatus::CompletedBefore => "COMPLETED_BEFORE",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Failed => "FAILED",
        }
    }
}

/// A wire is made at most once per key and can be reversed afterwards.
async fn make_wire(ctx: Context, transfer: Transfer) -> Result<String, HandlerError> {
    let status: PaymentStatus = ctx.get_state("status")?.unwrap_or(PaymentStatus::New);
    if status != PaymentStatus::New {
        return Ok(status.label().to_string());
    }
    ctx.set_state("payment", &transfer)?;

    let token = journaled_token(&ctx).await?;
    let withdrawn: bool = ctx
        .call(&account_target("withdraw", &transfer.from), &token, &transfer.cents)
        .await?;
    if !withdrawn {
        ctx.set_state("status", &PaymentStatus::Failed)?;
        return Ok("FAILED".to_string());
    }
    ctx.call::<_, ()>(&account_target("deposit", &transfer.to), &token, &transfer.cents)
        .await?;

    ctx.set_state("status", &PaymentStatus::CompletedBefore)?;
    Ok("SUCCESS".to_string())
}

async fn cancel_wire(ctx: Context, _: ()) -> Result<String, HandlerError> {
    let status: PaymentStatus = ctx.get_state("status")?.unwrap_or(PaymentStatus::New);
    ctx.set_state("status", &PaymentStatus::Cancelled)?;
    if status != PaymentStatus::CompletedBefore {
        return Ok("CANCELLED".to_string());
    }

    let Some(transfer) = ctx.get_state::<Transfer>("payment")? else {
        return Err(HandlerError::terminal("completed wire has no payment recorded"));
    };
    let token = ctx.deterministic_token();
    ctx.call::<_, bool>(&account_target("withdraw", &transfer.to), &token, &transfer.cents)
        .await?;
    ctx.call::<_, ()>(&account_target("deposit", &transfer.from), &token, &transfer.cents)
        .await?;
    Ok("REVERSED".to_string())
}

pub fn wire() -> ServiceDefinition {
    ServiceDefinition::virtual_object("wire")
        .handler("make", handler_fn(make_wire))
        .handler("cancel", handler_fn(cancel_wire))
}

/// Transfers at or above the threshold wait for an `approve` call.
async fn approval_run(ctx: Context, transfer: Transfer) -> Result<bool, HandlerError> {
    if transfer.cents >= APPROVAL_THRESHOLD {
        ctx.set_state("amount", &transfer.cents)?;
        let approved: bool = ctx.await_promise("approved").await?;
        if !approved {
            info!(cents = transfer.cents, "transfer rejected");
            return Ok(false);
        }
    }
    move_money(ctx, transfer).await
}

async fn approve(ctx: Context, approved: bool) -> Result<ResolveOutcome, HandlerError> {
    ctx.resolve_promise("approved", &approved).await
}

async fn check_amount(ctx: Context, _: ()) -> Result<i64, HandlerError> {
    Ok(ctx.get_state("amount")?.unwrap_or(-1))
}

pub fn approval_workflow() -> ServiceDefinition {
    ServiceDefinition::workflow("transfer_workflow")
        .run(handler_fn(approval_run))
        .shared("approve", handler_fn(approve))
        .shared("checkAmount", handler_fn(check_amount))
}

pub fn all() -> Vec<ServiceDefinition> {
    vec![
        account(),
        transfer_service(),
        txn_service(),
        wire(),
        approval_workflow(),
    ]
}

/// Handlers the binary refuses to start without.
pub const EXPECTED_HANDLERS: &[&str] = &[
    "account/deposit",
    "account/withdraw",
    "transfer/transfer",
    "wire/make",
    "wire/cancel",
    "transfer_workflow/run",
    "transfer_workflow/approve",
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spool_core::{
        Engine, EngineBuilder, EngineConfig, InvocationResponse, RetryPolicy, ServiceId,
    };

    fn builder() -> EngineBuilder {
        let mut builder = EngineBuilder::new().expect_handlers(EXPECTED_HANDLERS);
        for service in all() {
            builder = builder.service(service).unwrap();
        }
        builder
    }

    async fn engine() -> Engine {
        builder().build().await.unwrap()
    }

    fn wire_transfer(cents: u64) -> Transfer {
        Transfer {
            from: "A".to_string(),
            to: "B".to_string(),
            cents,
        }
    }

    async fn balance_of(engine: &Engine, account: &str) -> u64 {
        engine
            .state_value::<u64>(&ServiceId::new("account", account), "balance")
            .await
            .unwrap()
            .unwrap_or(INITIAL_BALANCE)
    }

    fn value(response: InvocationResponse) -> serde_json::Value {
        response.value().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn wire_is_made_once_and_reversed() {
        let engine = engine().await;
        let make = InvocationTarget::keyed("wire", "make", "w1");

        let first = engine.invoke(make.clone(), &wire_transfer(3_000)).await.unwrap();
        assert_eq!(value(first), json!("SUCCESS"));
        let again = engine.invoke(make, &wire_transfer(3_000)).await.unwrap();
        assert_eq!(value(again), json!("COMPLETED_BEFORE"));
        assert_eq!(balance_of(&engine, "A").await, 97_000);

        let cancel = engine
            .invoke(InvocationTarget::keyed("wire", "cancel", "w1"), &())
            .await
            .unwrap();
        assert_eq!(value(cancel), json!("REVERSED"));
        assert_eq!(balance_of(&engine, "A").await, INITIAL_BALANCE);
        assert_eq!(balance_of(&engine, "B").await, INITIAL_BALANCE);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_wire_is_never_made() {
        let engine = engine().await;

        let cancel = engine
            .invoke(InvocationTarget::keyed("wire", "cancel", "w2"), &())
            .await
            .unwrap();
        assert_eq!(value(cancel), json!("CANCELLED"));
        let make = engine
            .invoke(InvocationTarget::keyed("wire", "make", "w2"), &wire_transfer(3_000))
            .await
            .unwrap();
        assert_eq!(value(make), json!("CANCELLED"));
        assert_eq!(balance_of(&engine, "A").await, INITIAL_BALANCE);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn large_transfer_waits_for_approval() {
        let engine = engine().await;
        let run = engine
            .invoke(
                InvocationTarget::keyed("transfer_workflow", "run", "t1"),
                &wire_transfer(APPROVAL_THRESHOLD),
            )
            .await
            .unwrap();
        assert!(run.is_suspended());

        engine
            .invoke(InvocationTarget::keyed("transfer_workflow", "approve", "t1"), &true)
            .await
            .unwrap();
        let done = engine.wait_for(run.id()).await.unwrap();
        assert_eq!(value(done), json!(true));
        assert_eq!(balance_of(&engine, "B").await, INITIAL_BALANCE + APPROVAL_THRESHOLD);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn flaky_account_settles_and_replays() {
        let quick = Duration::from_millis(1);
        let engine = builder()
            .config(EngineConfig {
                step_retry: RetryPolicy::new(quick, 1.0, quick).with_max_attempts(60),
                ..EngineConfig::default()
            })
            .build()
            .await
            .unwrap();

        let response = engine
            .invoke(InvocationTarget::keyed("account", "deposit", "8x"), &500u64)
            .await
            .unwrap();
        assert!(matches!(response, InvocationResponse::Completed { .. }));
        assert_eq!(balance_of(&engine, "8x").await, INITIAL_BALANCE + 500);
        assert!(engine.verify_replay(response.id()).await.unwrap().is_reproduced());
        engine.shutdown().await;
    }
}
