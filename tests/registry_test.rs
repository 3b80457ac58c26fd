use billing_core::application::registry::TransactionRegistry;
use billing_core::domain::payment::{BackendFunction, TransactionId};
use billing_core::error::BackendError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

fn success(token: &str) -> String {
    format!(r#"{{"status":"success","data":{{"Token":"{token}"}}}}"#)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_and_out_of_order_callbacks_complete_once() {
    let registry = TransactionRegistry::new();
    let callbacks = registry.callbacks();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut receivers = Vec::new();
    let mut posts = Vec::new();
    for i in 0..64 {
        let (id, rx) = registry.register(BackendFunction::PaymentToken).await;
        let copies = rng.gen_range(1..=4);
        for _ in 0..copies {
            posts.push((id.to_string(), success(&format!("t-{i}"))));
        }
        receivers.push((i, rx));
    }
    for _ in 0..16 {
        posts.push((TransactionId::new().to_string(), success("stray")));
    }
    posts.push(("not-a-transaction".to_string(), success("garbage")));
    posts.shuffle(&mut rng);
    let total = posts.len();

    let mut handles = Vec::new();
    for (id, raw) in posts {
        let callbacks = callbacks.clone();
        handles.push(tokio::spawn(async move { callbacks.post_result(&id, &raw).await }));
    }
    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 64);
    assert!(total > accepted);
    assert_eq!(registry.pending_count().await, 0);
    for (i, rx) in receivers {
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.extract_token(), Some(format!("t-{i}")));
    }
}

#[tokio::test]
async fn test_callback_after_removal_is_ignored() {
    let registry = TransactionRegistry::new();
    let callbacks = registry.callbacks();
    let (id, rx) = registry.register(BackendFunction::Subscription).await;

    assert!(registry.remove(id).await);
    assert!(!callbacks.post_result(&id.to_string(), &success("late")).await);
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn test_fail_all_resolves_every_waiter() {
    let registry = TransactionRegistry::new();
    let mut receivers = Vec::new();
    for _ in 0..3 {
        receivers.push(registry.register(BackendFunction::GetSubscriptions).await.1);
    }

    assert_eq!(registry.fail_all("closing").await, 3);

    for rx in receivers {
        assert_eq!(
            rx.await.unwrap().unwrap_err(),
            BackendError::Closed("closing".to_string())
        );
    }
    assert_eq!(registry.pending_count().await, 0);
}

#[tokio::test]
async fn test_error_status_is_delivered_as_rejection() {
    let registry = TransactionRegistry::new();
    let callbacks = registry.callbacks();
    let (id, rx) = registry.register(BackendFunction::PaymentToken).await;

    let raw = r#""{\"status\":\"error\",\"message\":\"Invalid purchase token\"}""#;
    assert!(callbacks.post_result(&id.to_string(), raw).await);

    assert_eq!(
        rx.await.unwrap().unwrap_err(),
        BackendError::Rejected("Invalid purchase token".to_string())
    );
}
