mod common;

use common::*;
use serde_json::json;
use spool_core::domain::InvocationStatus;
use spool_core::ports::FixedClock;
use spool_core::{
    InvocationRequest, InvocationResponse, InvocationTarget, ReplayReport, ServiceId,
};

fn transfer_target() -> InvocationTarget {
    InvocationTarget::service("transfer", "transfer")
}

fn workflow(key: &str, handler: &str) -> InvocationTarget {
    InvocationTarget::keyed("transfer_workflow", handler, key)
}

#[tokio::test]
async fn transfer_moves_money_once() {
    let engine = bank().build().await.unwrap();

    let response = engine
        .invoke(transfer_target(), &Transfer::new("A", "B", 5_000))
        .await
        .unwrap();
    assert_eq!(completed(&response), json!(true));
    assert_eq!(balance_of(&engine, "A").await, 95_000);
    assert_eq!(balance_of(&engine, "B").await, 105_000);

    let withdraws = engine
        .invocations()
        .await
        .into_iter()
        .filter(|v| v.target.handler == "withdraw")
        .count();
    assert_eq!(withdraws, 1);
    assert_eq!(
        engine.verify_replay(response.id()).await.unwrap(),
        ReplayReport::Reproduced { steps: 3 }
    );
    assert_eq!(balance_of(&engine, "A").await, 95_000);

    engine.shutdown().await;
}

#[tokio::test]
async fn retried_call_with_the_same_token_does_not_double_debit() {
    let engine = bank().build().await.unwrap();
    let withdraw = InvocationTarget::keyed("account", "withdraw", "A");

    let first = engine
        .invoke_request(
            InvocationRequest::new(withdraw.clone(), json!(5_000)).with_idempotency_key("T"),
        )
        .await
        .unwrap();
    let again = engine
        .invoke_request(InvocationRequest::new(withdraw, json!(5_000)).with_idempotency_key("T"))
        .await
        .unwrap();

    assert_eq!(first.id(), again.id());
    assert_eq!(completed(&again), json!(true));
    assert_eq!(balance_of(&engine, "A").await, 95_000);
    engine.shutdown().await;
}

#[tokio::test]
async fn failed_deposit_refunds_the_source() {
    let engine = bank().build().await.unwrap();

    let response = engine
        .invoke(transfer_target(), &Transfer::new("A", "9B", 5_000))
        .await
        .unwrap();

    assert_eq!(completed(&response), json!(false));
    assert_eq!(balance_of(&engine, "A").await, INITIAL_BALANCE);
    assert_eq!(engine.state(&account_id("9B")).await.len(), 0);

    let deposits = engine
        .invocations()
        .await
        .into_iter()
        .filter(|v| v.target.handler == "deposit")
        .count();
    assert_eq!(deposits, 2, "failed deposit plus one refund");
    engine.shutdown().await;
}

#[tokio::test]
async fn insufficient_funds_skip_the_deposit() {
    let engine = bank().build().await.unwrap();

    let response = engine
        .invoke(transfer_target(), &Transfer::new("A", "B", 200_000))
        .await
        .unwrap();

    assert_eq!(completed(&response), json!(false));
    assert_eq!(balance_of(&engine, "A").await, INITIAL_BALANCE);
    assert!(engine.state(&account_id("B")).await.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn unavailable_source_fails_the_transfer() {
    let engine = bank().build().await.unwrap();

    let response = engine
        .invoke(transfer_target(), &Transfer::new("9A", "B", 5_000))
        .await
        .unwrap();

    match response {
        InvocationResponse::Failed { error, .. } => {
            assert_eq!(error.message, "Account unavailable");
        }
        other => panic!("unexpected response {other:?}"),
    }
    assert!(engine.state(&account_id("B")).await.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn rejected_approval_never_touches_the_accounts() {
    let engine = bank().build().await.unwrap();

    let run = engine
        .invoke(workflow("t1", "run"), &Transfer::new("A", "B", 12_000))
        .await
        .unwrap();
    assert!(run.is_suspended());

    let amount = engine
        .invoke(workflow("t1", "checkAmount"), &())
        .await
        .unwrap();
    assert_eq!(completed(&amount), json!(12_000));

    let approve = engine
        .invoke(workflow("t1", "approve"), &false)
        .await
        .unwrap();
    assert_eq!(completed(&approve), json!({"outcome": "resolved"}));

    let done = engine.wait_for(run.id()).await.unwrap();
    assert_eq!(completed(&done), json!(false));
    assert!(engine.state(&account_id("A")).await.is_empty());
    assert!(
        engine
            .invocations()
            .await
            .iter()
            .all(|v| v.target.service != "account")
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn approved_transfer_proceeds() {
    let engine = bank().build().await.unwrap();

    let run = engine
        .invoke(workflow("t2", "run"), &Transfer::new("A", "B", 12_000))
        .await
        .unwrap();
    assert!(run.is_suspended());
    let view = engine.invocation(run.id()).await.unwrap();
    assert!(matches!(
        view.status,
        InvocationStatus::SuspendedOnPromise { ref name, .. } if name == "approved"
    ));

    engine
        .invoke(workflow("t2", "approve"), &true)
        .await
        .unwrap();
    let done = engine.wait_for(run.id()).await.unwrap();

    assert_eq!(completed(&done), json!(true));
    assert_eq!(balance_of(&engine, "A").await, 88_000);
    assert_eq!(balance_of(&engine, "B").await, 112_000);
    assert!(engine.verify_replay(run.id()).await.unwrap().is_reproduced());
    engine.shutdown().await;
}

#[tokio::test]
async fn small_transfers_need_no_approval() {
    let engine = bank().build().await.unwrap();

    let run = engine
        .invoke(workflow("t3", "run"), &Transfer::new("A", "B", 500))
        .await
        .unwrap();
    assert_eq!(completed(&run), json!(true));

    let amount = engine
        .invoke(workflow("t3", "checkAmount"), &())
        .await
        .unwrap();
    assert_eq!(completed(&amount), json!(-1));
    engine.shutdown().await;
}

#[tokio::test]
async fn workflow_run_executes_once_per_key() {
    let engine = bank().build().await.unwrap();

    let first = engine
        .invoke(workflow("t4", "run"), &Transfer::new("A", "B", 1_000))
        .await
        .unwrap();
    let second = engine
        .invoke(workflow("t4", "run"), &Transfer::new("A", "B", 7_000))
        .await
        .unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(completed(&second), json!(true));
    assert_eq!(balance_of(&engine, "A").await, 99_000);
    engine.shutdown().await;
}

#[tokio::test]
async fn failed_deposit_is_retried_a_day_later_then_refunded() {
    let clock = FixedClock::new(t0());
    let engine = bank().clock(clock.clone()).build().await.unwrap();

    let response = engine
        .invoke(
            InvocationTarget::service("txn", "transfer"),
            &Transfer::new("A", "9B", 5_000),
        )
        .await
        .unwrap();
    assert!(response.is_suspended());
    assert_eq!(balance_of(&engine, "A").await, 95_000);

    clock.advance(chrono::Duration::hours(12));
    assert_eq!(engine.fire_due_timers().await.unwrap(), 0);
    assert!(
        engine
            .invocation(response.id())
            .await
            .unwrap()
            .status
            .is_suspended()
    );

    clock.advance(chrono::Duration::hours(13));
    let done = engine.wait_for(response.id()).await.unwrap();
    assert_eq!(completed(&done), json!(false));
    assert_eq!(balance_of(&engine, "A").await, INITIAL_BALANCE);
    assert_eq!(
        engine.verify_replay(response.id()).await.unwrap(),
        ReplayReport::Reproduced { steps: 6 }
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn shared_reads_see_committed_state_only() {
    let engine = bank().build().await.unwrap();
    engine
        .invoke(InvocationTarget::keyed("account", "deposit", "C"), &250u64)
        .await
        .unwrap();

    let balance = engine
        .invoke(InvocationTarget::keyed("account", "balance", "C"), &())
        .await
        .unwrap();
    assert_eq!(completed(&balance), json!(100_250));
    assert_eq!(
        engine.state(&ServiceId::new("account", "C")).await.get("balance"),
        Some(&json!(100_250))
    );
    engine.shutdown().await;
}
