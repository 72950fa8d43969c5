//! Tests for the retry counter

use super::*;

fn counter(settings: FailoverSettings) -> RetryCounter {
    RetryCounter::new(Arc::new(settings))
}

fn fast_settings(max_attempts: u32) -> FailoverSettings {
    FailoverSettings {
        max_reconnect_attempts: max_attempts,
        initial_reconnect_delay: Duration::from_millis(1),
        max_reconnect_delay: Duration::from_millis(4),
        ..FailoverSettings::default()
    }
}

// ============================================================================
// Attempt Bounds
// ============================================================================

#[tokio::test]
async fn test_retry_stops_at_max_attempts() {
    let counter = counter(fast_settings(3));

    assert!(counter.retry().await);
    assert!(counter.retry().await);
    assert!(!counter.retry().await);

    assert_eq!(counter.attempts(), 3);
    assert_eq!(counter.total_attempts(), 3);
}

#[tokio::test]
async fn test_reset_keeps_cumulative_count() {
    let counter = counter(fast_settings(2));

    assert!(counter.retry().await);
    assert!(!counter.retry().await);

    counter.reset();
    assert_eq!(counter.attempts(), 0);
    assert_eq!(counter.total_attempts(), 2);

    assert!(counter.retry().await);
    assert_eq!(counter.total_attempts(), 3);
}

#[tokio::test]
async fn test_zero_max_attempts_allows_no_retry() {
    let counter = counter(fast_settings(0));

    assert!(!counter.retry().await);
}

// ============================================================================
// Backoff
// ============================================================================

#[test]
fn test_exponential_backoff_starts_at_baseline_and_caps() {
    let counter = counter(FailoverSettings {
        initial_reconnect_delay: Duration::from_millis(100),
        back_off_multiplier: 2.0,
        max_reconnect_delay: Duration::from_millis(500),
        ..FailoverSettings::default()
    });

    assert_eq!(counter.next_delay(), Duration::from_millis(100));
    assert_eq!(counter.next_delay(), Duration::from_millis(200));
    assert_eq!(counter.next_delay(), Duration::from_millis(400));
    assert_eq!(counter.next_delay(), Duration::from_millis(500));
    assert_eq!(counter.next_delay(), Duration::from_millis(500));
    assert_eq!(counter.last_delay(), Duration::from_millis(500));

    counter.reset();
    assert_eq!(counter.next_delay(), Duration::from_millis(100));
}

#[test]
fn test_constant_delay_without_exponential_backoff() {
    let counter = counter(FailoverSettings {
        use_exponential_back_off: false,
        initial_reconnect_delay: Duration::from_millis(250),
        ..FailoverSettings::default()
    });

    for _ in 0..4 {
        assert_eq!(counter.next_delay(), Duration::from_millis(250));
    }
}

#[test]
fn test_unrepresentable_backoff_saturates_at_max_delay() {
    for multiplier in [-1.0, f64::NAN, f64::INFINITY, f64::MAX] {
        let counter = counter(FailoverSettings {
            initial_reconnect_delay: Duration::from_millis(100),
            back_off_multiplier: multiplier,
            max_reconnect_delay: Duration::from_secs(2),
            ..FailoverSettings::default()
        });

        assert_eq!(counter.next_delay(), Duration::from_millis(100));
        assert_eq!(counter.next_delay(), Duration::from_secs(2), "multiplier {}", multiplier);
        assert_eq!(counter.next_delay(), Duration::from_secs(2), "multiplier {}", multiplier);
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_negative_multiplier_keeps_retrying() {
    let counter = counter(FailoverSettings {
        max_reconnect_attempts: 4,
        initial_reconnect_delay: Duration::from_millis(10),
        back_off_multiplier: -3.0,
        max_reconnect_delay: Duration::from_millis(50),
        ..FailoverSettings::default()
    });

    assert!(counter.retry().await);
    assert!(counter.retry().await);
    assert!(counter.retry().await);
    assert!(!counter.retry().await);
    assert_eq!(counter.last_delay(), Duration::from_millis(50));
}

// ============================================================================
// Failover Rotation
// ============================================================================

#[tokio::test]
async fn test_failover_host_follows_cumulative_count() {
    let hosts = ["tcp://a:61616", "tcp://b:61616", "tcp://c:61616"];
    let counter = counter(FailoverSettings {
        broker_uris: hosts.iter().map(|h| h.to_string()).collect(),
        ..fast_settings(2)
    });

    let mut selected = Vec::new();
    for _ in 0..7 {
        selected.push(counter.next_failover_host().unwrap().to_string());
        if !counter.retry().await {
            counter.reset();
        }
    }

    let expected: Vec<String> = (0..7).map(|k| hosts[k % 3].to_string()).collect();
    assert_eq!(selected, expected);
}

#[test]
fn test_no_failover_host_without_broker_uris() {
    let counter = counter(FailoverSettings::default());

    assert_eq!(counter.next_failover_host(), None);
}
