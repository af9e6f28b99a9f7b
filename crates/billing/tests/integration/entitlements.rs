//! Plan limits on transactions and goals, and concurrent goal contributions.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use finplan_billing::memory::{FakeProcessor, InMemoryStore, RecordingNotifier};
use finplan_billing::{
    BillingError, BillingService, BillingSettings, QuotaEnforcement, FREE_MONTHLY_TRANSACTIONS,
    FREE_TOTAL_GOALS,
};
use finplan_shared::{NewGoal, NewTransaction, PlanTier, TransactionKind};
use time::{Duration, OffsetDateTime};

fn service(store: &InMemoryStore, enforcement: QuotaEnforcement) -> BillingService {
    BillingService::with_store(
        Arc::new(store.clone()),
        Arc::new(FakeProcessor::new()),
        Arc::new(RecordingNotifier::new()),
        "whsec_test".to_string(),
        BillingSettings {
            quota_enforcement: enforcement,
            ..BillingSettings::default()
        },
    )
}

fn expense(date: time::Date) -> NewTransaction {
    NewTransaction {
        kind: TransactionKind::Expense,
        amount_cents: 4_250,
        category: "groceries".into(),
        description: None,
        date,
        recurring: false,
    }
}

fn goal(name: &str) -> NewGoal {
    NewGoal {
        name: name.into(),
        target_amount_cents: 500_000,
        current_amount_cents: 0,
        target_date: OffsetDateTime::now_utc().date() + Duration::days(365),
        priority: Default::default(),
    }
}

#[tokio::test]
async fn test_free_plan_transaction_limit() {
    for enforcement in [QuotaEnforcement::Soft, QuotaEnforcement::Strict] {
        let store = InMemoryStore::new();
        let billing = service(&store, enforcement);
        let user = store.seed_user("ana@example.com", PlanTier::Free);
        let today = OffsetDateTime::now_utc().date();

        for _ in 0..FREE_MONTHLY_TRANSACTIONS {
            billing
                .resources
                .add_transaction(user.id, &expense(today))
                .await
                .unwrap();
        }

        let err = billing
            .resources
            .add_transaction(user.id, &expense(today))
            .await
            .unwrap_err();
        assert!(
            matches!(err, BillingError::QuotaExceeded(_)),
            "{:?} enforcement allowed transaction 101",
            enforcement
        );
    }
}

#[tokio::test]
async fn test_previous_month_does_not_count() {
    let store = InMemoryStore::new();
    let billing = service(&store, QuotaEnforcement::Soft);
    let user = store.seed_user("ana@example.com", PlanTier::Free);
    let today = OffsetDateTime::now_utc().date();
    let last_month = today.replace_day(1).unwrap() - Duration::days(1);

    for _ in 0..FREE_MONTHLY_TRANSACTIONS {
        billing
            .resources
            .add_transaction(user.id, &expense(last_month))
            .await
            .unwrap();
    }

    billing
        .resources
        .add_transaction(user.id, &expense(today))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_free_plan_goal_limit() {
    let store = InMemoryStore::new();
    let billing = service(&store, QuotaEnforcement::Soft);
    let user = store.seed_user("ana@example.com", PlanTier::Free);

    for i in 0..FREE_TOTAL_GOALS {
        billing
            .resources
            .add_goal(user.id, &goal(&format!("Goal {}", i)))
            .await
            .unwrap();
    }

    let err = billing
        .resources
        .add_goal(user.id, &goal("One too many"))
        .await
        .unwrap_err();
    match err {
        BillingError::QuotaExceeded(reason) => assert!(reason.contains("goal")),
        other => panic!("expected quota error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_paid_plans_are_unlimited() {
    for plan in [PlanTier::Pro, PlanTier::Business] {
        let store = InMemoryStore::new();
        let billing = service(&store, QuotaEnforcement::Strict);
        let user = store.seed_user("bia@example.com", plan);
        let today = OffsetDateTime::now_utc().date();

        for _ in 0..FREE_MONTHLY_TRANSACTIONS + 20 {
            billing
                .resources
                .add_transaction(user.id, &expense(today))
                .await
                .unwrap();
        }
        for i in 0..FREE_TOTAL_GOALS + 5 {
            billing
                .resources
                .add_goal(user.id, &goal(&format!("Goal {}", i)))
                .await
                .unwrap();
        }
    }
}

#[tokio::test]
async fn test_unknown_user_is_not_found() {
    let store = InMemoryStore::new();
    let billing = service(&store, QuotaEnforcement::Soft);

    let err = billing
        .resources
        .add_goal(uuid::Uuid::new_v4(), &goal("Orphan"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));
}

#[tokio::test]
async fn test_invalid_input_checked_before_quota() {
    let store = InMemoryStore::new();
    let billing = service(&store, QuotaEnforcement::Soft);
    let user = store.seed_user("ana@example.com", PlanTier::Free);

    let mut bad = expense(OffsetDateTime::now_utc().date());
    bad.amount_cents = 0;
    let err = billing
        .resources
        .add_transaction(user.id, &bad)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));
}

/// Race `n` goal creations for a Free user one below the goal limit and
/// return how many were accepted. Every rejection must be a quota denial.
async fn race_last_goal_slot(enforcement: QuotaEnforcement, n: usize) -> usize {
    let store = InMemoryStore::new();
    let billing = Arc::new(service(&store, enforcement));
    let user = store.seed_user("ana@example.com", PlanTier::Free);
    for i in 1..FREE_TOTAL_GOALS {
        billing
            .resources
            .add_goal(user.id, &goal(&format!("Goal {}", i)))
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..n)
        .map(|i| {
            let billing = billing.clone();
            tokio::spawn(async move {
                billing
                    .resources
                    .add_goal(user.id, &goal(&format!("Racer {}", i)))
                    .await
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(BillingError::QuotaExceeded(_)) => {}
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }

    // Once the burst settles the limit holds again
    let err = billing
        .resources
        .add_goal(user.id, &goal("Late"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::QuotaExceeded(_)));

    accepted
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_strict_concurrent_goal_creation_never_overshoots() {
    assert_eq!(race_last_goal_slot(QuotaEnforcement::Strict, 16).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_soft_concurrent_goal_creation_overshoot_is_bounded() {
    let accepted = race_last_goal_slot(QuotaEnforcement::Soft, 16).await;
    assert!(accepted >= 1);
    assert!(accepted <= 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_goal_contributions_are_not_lost() {
    let store = InMemoryStore::new();
    let billing = Arc::new(service(&store, QuotaEnforcement::Soft));
    let user = store.seed_user("ana@example.com", PlanTier::Free);
    let created = billing.resources.add_goal(user.id, &goal("House")).await.unwrap();

    let a = {
        let billing = billing.clone();
        tokio::spawn(async move {
            billing
                .resources
                .increment_goal_progress(user.id, created.id, 1_000)
                .await
        })
    };
    let b = {
        let billing = billing.clone();
        tokio::spawn(async move {
            billing
                .resources
                .increment_goal_progress(user.id, created.id, 1_500)
                .await
        })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(store.goal(created.id).unwrap().current_amount_cents, 2_500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_contributions() {
    let store = InMemoryStore::new();
    let billing = Arc::new(service(&store, QuotaEnforcement::Soft));
    let user = store.seed_user("ana@example.com", PlanTier::Pro);
    let created = billing.resources.add_goal(user.id, &goal("Car")).await.unwrap();

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let billing = billing.clone();
            tokio::spawn(async move {
                billing
                    .resources
                    .increment_goal_progress(user.id, created.id, 100)
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(store.goal(created.id).unwrap().current_amount_cents, 5_000);
}

#[tokio::test]
async fn test_contribution_rules() {
    let store = InMemoryStore::new();
    let billing = service(&store, QuotaEnforcement::Soft);
    let owner = store.seed_user("ana@example.com", PlanTier::Free);
    let other = store.seed_user("bia@example.com", PlanTier::Free);
    let created = billing.resources.add_goal(owner.id, &goal("Trip")).await.unwrap();

    let err = billing
        .resources
        .increment_goal_progress(owner.id, created.id, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));

    // Someone else's goal looks like a missing one
    let err = billing
        .resources
        .increment_goal_progress(other.id, created.id, 500)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));
    assert_eq!(store.goal(created.id).unwrap().current_amount_cents, 0);
}
