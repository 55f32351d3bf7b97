//! Money-transfer services shared by the integration tests.
#![allow(dead_code)]

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use spool_core::domain::ResolveOutcome;
use spool_core::{
    Context, Engine, EngineBuilder, EngineConfig, HandlerError, IdempotencyToken,
    InvocationResponse, InvocationTarget, RetryPolicy, ServiceDefinition, ServiceId, handler_fn,
};

pub const INITIAL_BALANCE: u64 = 100_000;
pub const APPROVAL_THRESHOLD: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub from: String,
    pub to: String,
    pub cents: u64,
}

impl Transfer {
    pub fn new(from: &str, to: &str, cents: u64) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            cents,
        }
    }
}

fn unavailable(ctx: &Context) -> Result<(), HandlerError> {
    if ctx.key().is_some_and(|k| k.starts_with('9')) {
        return Err(HandlerError::terminal("Account unavailable"));
    }
    Ok(())
}

async fn deposit(ctx: Context, cents: u64) -> Result<(), HandlerError> {
    unavailable(&ctx)?;
    let balance: u64 = ctx.get_state("balance")?.unwrap_or(INITIAL_BALANCE);
    ctx.set_state("balance", &(balance + cents))
}

async fn withdraw(ctx: Context, cents: u64) -> Result<bool, HandlerError> {
    unavailable(&ctx)?;
    let balance: u64 = ctx.get_state("balance")?.unwrap_or(INITIAL_BALANCE);
    if balance < cents {
        return Ok(false);
    }
    ctx.set_state("balance", &(balance - cents))?;
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

/// Withdraw, deposit, and refund the source if the deposit fails terminally.
async fn move_money(ctx: &Context, transfer: &Transfer) -> Result<bool, HandlerError> {
    let token: IdempotencyToken = ctx
        .run("token", || async { Ok(IdempotencyToken::generate()) })
        .await?;

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
            refund(ctx, transfer).await?;
            Ok(false)
        }
    }
}

async fn refund(ctx: &Context, transfer: &Transfer) -> Result<(), HandlerError> {
    let refund_token = ctx.deterministic_token();
    ctx.call(&account_target("deposit", &transfer.from), &refund_token, &transfer.cents)
        .await
}

async fn transfer(ctx: Context, transfer: Transfer) -> Result<bool, HandlerError> {
    move_money(&ctx, &transfer).await
}

pub fn transfer_service() -> ServiceDefinition {
    ServiceDefinition::service("transfer").handler("transfer", handler_fn(transfer))
}

/// Like `transfer`, but a failed deposit is retried once a day later before
/// the refund.
async fn transfer_with_retry(ctx: Context, transfer: Transfer) -> Result<bool, HandlerError> {
    let token: IdempotencyToken = ctx
        .run("token", || async { Ok(IdempotencyToken::generate()) })
        .await?;
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
    e.into_terminal()?;

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

/// Approval-gated transfer, keyed by transfer id.
async fn approval_run(ctx: Context, transfer: Transfer) -> Result<bool, HandlerError> {
    if transfer.cents >= APPROVAL_THRESHOLD {
        ctx.set_state("amount", &transfer.cents)?;
        let approved: bool = ctx.await_promise("approved").await?;
        if !approved {
            return Ok(false);
        }
    }
    move_money(&ctx, &transfer).await
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

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(1), 1.0, Duration::from_millis(5))
        .with_max_attempts(max_attempts)
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        step_retry: fast_retry(5),
        invocation_retry: fast_retry(3),
        call_retry: fast_retry(3),
        timer_poll_interval_ms: 20,
    }
}

/// Builder with every bank service registered.
pub fn bank() -> EngineBuilder {
    EngineBuilder::new()
        .service(account())
        .unwrap()
        .service(transfer_service())
        .unwrap()
        .service(txn_service())
        .unwrap()
        .service(approval_workflow())
        .unwrap()
        .config(fast_config())
}

pub fn account_id(key: &str) -> ServiceId {
    ServiceId::new("account", key)
}

pub async fn balance_of(engine: &Engine, key: &str) -> u64 {
    engine
        .state_value::<u64>(&account_id(key), "balance")
        .await
        .unwrap()
        .unwrap_or(INITIAL_BALANCE)
}

pub fn completed(response: &InvocationResponse) -> serde_json::Value {
    match response {
        InvocationResponse::Completed { value, .. } => value.clone(),
        other => panic!("expected a completed invocation, got {other:?}"),
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
}

/// Wait for a condition the engine reaches asynchronously.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
