//! Reservation events travelling from the outbox through the bus and back
//! into confirmation.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use couponhub_core::traits::{BusMessage, MessageBus};
use couponhub_database::{OutboxRepository, ReservationRepository};
use couponhub_entity::outbox::{CouponReservedPayload, OutboxStatus};
use couponhub_entity::reservation::ReservationStatus;
use couponhub_worker::{DeliveryOutcome, MAX_DELIVERIES};

use helpers::{COUPON_CODE, FlakyBus, TestApp, UnavailableWrites};

const TOPIC: &str = "coupon.reserved";
const GROUP: &str = "coupon-confirmation";

#[tokio::test]
async fn test_reserved_coupon_is_confirmed_end_to_end() {
    let app = TestApp::new(5).await;
    let reservation = app
        .reservations
        .reserve(app.coupon.id, Uuid::new_v4(), COUPON_CODE, "order-1")
        .await
        .unwrap();

    let report = app.publisher().publish_pending().await.unwrap().unwrap();
    assert_eq!(report.published, 1);

    let consumer = app.consumer();
    let mut subscription = consumer.subscribe().await.unwrap();
    let outcome = consumer.poll_once(subscription.as_mut()).await.unwrap();
    assert_eq!(outcome, Some(DeliveryOutcome::Confirmed));

    let stored = app
        .db
        .find_reservation(reservation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ReservationStatus::Confirmed);

    let issued = app.db.user_coupons_of(app.coupon.id).unwrap();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].issued_idempotency_key, "order-1");
    assert_eq!(app.bus.outstanding(TOPIC, GROUP), 0);
}

#[tokio::test]
async fn test_duplicate_delivery_issues_once() {
    let app = TestApp::new(5).await;
    app.reservations
        .reserve(app.coupon.id, Uuid::new_v4(), COUPON_CODE, "order-dup")
        .await
        .unwrap();
    app.publisher().publish_pending().await.unwrap();

    // The bus delivers at least once; a second copy must be harmless.
    let original = app.bus.published(TOPIC).remove(0);
    app.bus.publish(TOPIC, &original).await.unwrap();

    let consumer = app.consumer();
    let mut subscription = consumer.subscribe().await.unwrap();
    for _ in 0..2 {
        let outcome = consumer.poll_once(subscription.as_mut()).await.unwrap();
        assert_eq!(outcome, Some(DeliveryOutcome::Confirmed));
    }

    assert_eq!(app.db.user_coupons_of(app.coupon.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_claimed_event_stays_processing() {
    let app = TestApp::new(5).await;
    app.reservations
        .reserve(app.coupon.id, Uuid::new_v4(), COUPON_CODE, "order-stuck")
        .await
        .unwrap();
    let event = app.db.outbox_events().unwrap().remove(0);

    // A publisher that claimed the event and died before settling it.
    assert!(app.db.claim(event.id).await.unwrap());

    let report = app.publisher().publish_pending().await.unwrap().unwrap();
    assert_eq!(report.fetched, 0);
    assert!(app.bus.published(TOPIC).is_empty());

    let stats = app.db.stats().await.unwrap();
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.new, 0);
}

#[tokio::test]
async fn test_failed_publish_is_resubmitted() {
    let app = TestApp::new(5).await;
    app.reservations
        .reserve(app.coupon.id, Uuid::new_v4(), COUPON_CODE, "order-retry")
        .await
        .unwrap();

    let publisher = app.publisher_with(Arc::new(FlakyBus::new(app.bus.clone(), 1)));

    let report = publisher.publish_pending().await.unwrap().unwrap();
    assert_eq!(report.failed, 1);
    let event = app.db.outbox_events().unwrap().remove(0);
    assert_eq!(event.status, OutboxStatus::Failed);
    assert_eq!(event.attempts, 1);
    assert!(event.last_error.is_some());

    // Failed events are not retried until resubmitted.
    let report = publisher.publish_pending().await.unwrap().unwrap();
    assert_eq!(report.fetched, 0);

    assert_eq!(publisher.resubmit_failed(3).await.unwrap(), 1);
    let report = publisher.publish_pending().await.unwrap().unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(app.bus.published(TOPIC).len(), 1);
}

#[tokio::test]
async fn test_resubmit_respects_attempt_limit() {
    let app = TestApp::new(5).await;
    app.reservations
        .reserve(app.coupon.id, Uuid::new_v4(), COUPON_CODE, "order-limit")
        .await
        .unwrap();

    let publisher = app.publisher_with(Arc::new(FlakyBus::new(app.bus.clone(), u32::MAX)));
    publisher.publish_pending().await.unwrap();

    assert_eq!(publisher.resubmit_failed(1).await.unwrap(), 0);
    assert_eq!(publisher.stats().await.unwrap().failed, 1);
}

#[tokio::test]
async fn test_unexpected_event_type_is_dropped() {
    let app = TestApp::new(5).await;
    let consumer = app.consumer();
    let mut subscription = consumer.subscribe().await.unwrap();

    let message = BusMessage {
        key: "k".to_string(),
        event_type: "coupon.audited".to_string(),
        payload: serde_json::json!({}),
    };
    app.bus.publish(TOPIC, &message).await.unwrap();

    let outcome = consumer.poll_once(subscription.as_mut()).await.unwrap();
    assert_eq!(outcome, Some(DeliveryOutcome::Dropped));
    assert_eq!(app.bus.outstanding(TOPIC, GROUP), 0);
}

#[tokio::test]
async fn test_unknown_reservation_is_rejected_without_redelivery() {
    let app = TestApp::new(5).await;
    let consumer = app.consumer();
    let mut subscription = consumer.subscribe().await.unwrap();

    let payload = CouponReservedPayload {
        reservation_id: Uuid::new_v4(),
        coupon_id: app.coupon.id,
        user_id: Uuid::new_v4(),
        coupon_code: COUPON_CODE.to_string(),
        idempotency_key: "order-ghost".to_string(),
    };
    let message = BusMessage {
        key: payload.idempotency_key.clone(),
        event_type: CouponReservedPayload::EVENT_TYPE.to_string(),
        payload: serde_json::to_value(&payload).unwrap(),
    };
    app.bus.publish(TOPIC, &message).await.unwrap();

    let outcome = consumer.poll_once(subscription.as_mut()).await.unwrap();
    assert_eq!(outcome, Some(DeliveryOutcome::Rejected));

    let outcome = consumer.poll_once(subscription.as_mut()).await.unwrap();
    assert_eq!(outcome, None);
    assert_eq!(app.bus.outstanding(TOPIC, GROUP), 0);
}

#[tokio::test]
async fn test_rejected_confirmation_fails_reservation_and_returns_unit() {
    let app = TestApp::new(5).await;
    let user = Uuid::new_v4();
    let reservation = app
        .reservations
        .reserve(app.coupon.id, user, COUPON_CODE, "order-late")
        .await
        .unwrap();
    app.publisher().publish_pending().await.unwrap();
    assert_eq!(app.quota_remaining().await, Some(4));

    // The user got the coupon directly before the event was consumed.
    app.issuance()
        .issue(app.coupon.id, user, "direct-1")
        .await
        .unwrap();

    let consumer = app.consumer();
    let mut subscription = consumer.subscribe().await.unwrap();
    let outcome = consumer.poll_once(subscription.as_mut()).await.unwrap();
    assert_eq!(outcome, Some(DeliveryOutcome::Rejected));
    assert_eq!(app.bus.outstanding(TOPIC, GROUP), 0);

    let stored = app
        .db
        .find_reservation(reservation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ReservationStatus::Failed);
    assert_eq!(app.quota_remaining().await, Some(5));
    assert_eq!(app.db.user_coupons_of(app.coupon.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_transient_failures_abandon_reservation_after_limit() {
    let app = TestApp::new(5).await;
    let reservation = app
        .reservations
        .reserve(app.coupon.id, Uuid::new_v4(), COUPON_CODE, "order-down")
        .await
        .unwrap();
    app.publisher().publish_pending().await.unwrap();

    let broken = app.reservations_with(Arc::new(UnavailableWrites(app.db.clone())));
    let consumer = app.consumer_with(broken);
    let mut subscription = consumer.subscribe().await.unwrap();

    for _ in 1..MAX_DELIVERIES {
        let outcome = consumer.poll_once(subscription.as_mut()).await.unwrap();
        assert_eq!(outcome, Some(DeliveryOutcome::Redelivered));
    }
    let outcome = consumer.poll_once(subscription.as_mut()).await.unwrap();
    assert_eq!(outcome, Some(DeliveryOutcome::Dropped));

    let outcome = consumer.poll_once(subscription.as_mut()).await.unwrap();
    assert_eq!(outcome, None);

    let stored = app
        .db
        .find_reservation(reservation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ReservationStatus::Failed);
    assert_eq!(app.quota_remaining().await, Some(5));
    assert_eq!(app.db.count_pending(app.coupon.id).await.unwrap(), 0);
    assert!(app.db.user_coupons_of(app.coupon.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_run_confirms_until_cancelled() {
    let app = TestApp::new(5).await;
    app.reservations
        .reserve(app.coupon.id, Uuid::new_v4(), COUPON_CODE, "order-run")
        .await
        .unwrap();
    app.publisher().publish_pending().await.unwrap();

    let consumer = Arc::new(app.consumer());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        async move { consumer.run(cancel_rx).await }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while app.db.user_coupons_of(app.coupon.id).unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "reservation never confirmed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("consumer stops on cancel")
        .unwrap()
        .unwrap();
}
