//! Routes inbound messages to matching handlers

use super::registry::SubscriptionRegistry;
use crate::error::SessionError;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, trace, warn};

/// Outcome of dispatching one inbound message
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<SessionError>,
}

impl DispatchReport {
    pub fn matched(&self) -> usize {
        self.delivered + self.failures.len()
    }
}

pub struct Dispatcher;

impl Dispatcher {
    /// Invoke every matching handler in registration order.
    ///
    /// Errors and panics from one handler are collected and never stop
    /// delivery to the rest.
    pub fn dispatch(registry: &SubscriptionRegistry, topic: &str, payload: &[u8]) -> DispatchReport {
        let _span = crate::dispatch_span!(topic).entered();
        let mut report = DispatchReport::default();

        for entry in registry.matching(topic) {
            let pattern = entry.pattern.as_str();
            let outcome = catch_unwind(AssertUnwindSafe(|| entry.handler.handle(topic, payload)));

            match outcome {
                Ok(Ok(())) => {
                    trace!(pattern = %pattern, "Handler completed");
                    report.delivered += 1;
                }
                Ok(Err(e)) => {
                    warn!(pattern = %pattern, error = %e, "Handler returned an error");
                    report
                        .failures
                        .push(SessionError::handler(pattern, topic, e.to_string()));
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(pattern = %pattern, panic = %message, "Handler panicked");
                    report
                        .failures
                        .push(SessionError::handler(pattern, topic, format!("handler panicked: {message}")));
                }
            }
        }

        if report.matched() == 0 {
            debug!("No subscription matched inbound message");
        }

        report
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::registry::{HandlerResult, SubscriptionEntry};
    use crate::session::QoS;
    use crate::topic::TopicPattern;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(registry: &mut SubscriptionRegistry, pattern: &str, log: &Log) {
        let log = log.clone();
        let tag = pattern.to_string();
        registry.insert(SubscriptionEntry {
            pattern: TopicPattern::parse(pattern).unwrap(),
            qos: QoS::AtMostOnce,
            handler: Arc::new(move |topic: &str, _: &[u8]| -> HandlerResult {
                log.lock().push(format!("{tag} <- {topic}"));
                Ok(())
            }),
        });
    }

    fn failing(registry: &mut SubscriptionRegistry, pattern: &str) {
        registry.insert(SubscriptionEntry {
            pattern: TopicPattern::parse(pattern).unwrap(),
            qos: QoS::AtMostOnce,
            handler: Arc::new(|_: &str, _: &[u8]| -> HandlerResult { Err("bad payload".into()) }),
        });
    }

    fn panicking(registry: &mut SubscriptionRegistry, pattern: &str) {
        registry.insert(SubscriptionEntry {
            pattern: TopicPattern::parse(pattern).unwrap(),
            qos: QoS::AtMostOnce,
            handler: Arc::new(|_: &str, _: &[u8]| -> HandlerResult { panic!("handler exploded") }),
        });
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let log = Log::default();
        let mut registry = SubscriptionRegistry::new();
        recording(&mut registry, "machines/#", &log);
        recording(&mut registry, "alerts/#", &log);
        recording(&mut registry, "machines/+/status", &log);

        let report = Dispatcher::dispatch(&registry, "machines/5/status", b"online");
        assert_eq!(report.delivered, 2);
        assert!(report.failures.is_empty());
        assert_eq!(
            *log.lock(),
            vec![
                "machines/# <- machines/5/status",
                "machines/+/status <- machines/5/status"
            ]
        );
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let log = Log::default();
        let mut registry = SubscriptionRegistry::new();
        failing(&mut registry, "alerts/#");
        recording(&mut registry, "alerts/+", &log);

        let report = Dispatcher::dispatch(&registry, "alerts/critical", b"low-stock");
        assert_eq!(report.delivered, 1);
        assert_eq!(
            report.failures,
            vec![SessionError::handler("alerts/#", "alerts/critical", "bad payload")]
        );
        assert_eq!(*log.lock(), vec!["alerts/+ <- alerts/critical"]);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let log = Log::default();
        let mut registry = SubscriptionRegistry::new();
        panicking(&mut registry, "maintenance/#");
        recording(&mut registry, "maintenance/+", &log);

        let report = Dispatcher::dispatch(&registry, "maintenance/door", b"open");
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].to_string().contains("handler exploded"));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_no_match() {
        let log = Log::default();
        let mut registry = SubscriptionRegistry::new();
        recording(&mut registry, "payments/#", &log);

        let report = Dispatcher::dispatch(&registry, "machines/1/status", b"");
        assert_eq!(report.matched(), 0);
        assert!(log.lock().is_empty());
    }
}
