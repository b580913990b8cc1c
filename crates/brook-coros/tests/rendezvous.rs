//! End-to-end rendezvous scenarios: coroutines suspending on pumps,
//! promise settlement, reply/error races, and the error policies, driven
//! by a responder that answers synchronously inside the request post.

use brook_coros::{CoroState, EventError, Promise, ReplyPump, ReplyPumps, Runtime, Value, Which};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;

type Slot<T> = Rc<RefCell<Option<T>>>;

fn slot<T>() -> (Slot<T>, Slot<T>) {
    let cell = Rc::new(RefCell::new(None));
    (cell.clone(), cell)
}

/// Test runtime with log output wired to the test harness
fn runtime() -> Runtime {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Runtime::new()
}

/// Service answering requests synchronously, inside the request post: it
/// replies `value + 1` on the pump named by the request's `"reply"` key,
/// or on the pump named by the `"error"` key when the request carries a
/// `"fail"` marker.
fn install_immediate_service(rt: &Runtime, pump_name: &str) {
    let pumps = rt.pumps().clone();
    rt.obtain(pump_name)
        .listen("immediate-service", move |request: &Value| {
            let value = request["value"].as_i64().unwrap_or(0);
            let target_key = if request.get("fail").is_some() {
                "error"
            } else {
                "reply"
            };
            match request[target_key].as_str() {
                Some(target) => {
                    pumps.obtain(target).post(&json!(value + 1));
                    true
                }
                None => false,
            }
        })
        .unwrap();
}

#[test]
fn test_explicit_promise_wait() {
    let rt = runtime();
    let promise: Promise<String> = Promise::new();
    let (got, sink) = slot();

    let waiter = promise.clone();
    let handle = rt.launch("explicit-waiter", move |co| async move {
        *sink.borrow_mut() = Some(waiter.wait(&co).await);
        Ok(())
    });

    // Parked on the promise; nothing delivered yet
    assert_eq!(handle.state(), CoroState::Suspended);
    assert!(got.borrow().is_none());

    promise.set_value("received".to_string()).unwrap();
    assert_eq!(handle.state(), CoroState::Completed);
    assert_eq!(*got.borrow(), Some("received".to_string()));
}

#[test]
fn test_wait_on_named_pump() {
    let rt = runtime();
    let (got, sink) = slot();

    let handle = rt.launch("listener", move |co| async move {
        *sink.borrow_mut() = Some(co.suspend_until_event_on("source").await);
        Ok(())
    });
    assert_eq!(handle.state(), CoroState::Suspended);

    rt.obtain("source").post(&json!("received"));
    assert_eq!(*got.borrow(), Some(json!("received")));
    assert_eq!(handle.state(), CoroState::Completed);
}

#[test]
fn test_waiter_pump_delivery() {
    let rt = runtime();
    let (got, sink) = slot();
    let (name, name_sink) = slot();

    rt.launch("helper-waiter", move |co| async move {
        let wait = ReplyPump::new(&co.runtime());
        *name_sink.borrow_mut() = Some(wait.name().to_string());
        *sink.borrow_mut() = Some(wait.suspend(&co).await);
        Ok(())
    });

    // The generated pump name was published before suspending
    let name = name.borrow().clone().unwrap();
    rt.obtain(&name).post(&json!(17));
    assert_eq!(*got.borrow(), Some(json!(17)));

    // The helper dropped with the coroutine, removing its pump
    assert!(!rt.pumps().contains(&name));
}

#[test]
fn test_waiter_pair_reply_side() {
    let rt = runtime();
    let (got, sink) = slot();
    let (names, names_sink) = slot();

    rt.launch("race-waiter", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        *names_sink.borrow_mut() = Some((pair.name0().to_string(), pair.name1().to_string()));
        *sink.borrow_mut() = Some(pair.suspend(&co).await);
        Ok(())
    });

    let (reply_name, error_name) = names.borrow().clone().unwrap();
    rt.obtain(&reply_name).post(&json!("victory"));

    let (value, which) = got.borrow().clone().unwrap();
    assert_eq!(value, json!("victory"));
    assert_eq!(which, Which::Reply);
    assert_eq!(which.index(), 0);

    // A late post on the losing pump has no effect on anything
    assert!(!rt.obtain(&error_name).post(&json!("defeat")));
}

#[test]
fn test_waiter_pair_error_side() {
    let rt = runtime();
    let (got, sink) = slot();
    let (names, names_sink) = slot();

    rt.launch("race-waiter", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        *names_sink.borrow_mut() = Some((pair.name0().to_string(), pair.name1().to_string()));
        *sink.borrow_mut() = Some(pair.suspend(&co).await);
        Ok(())
    });

    let (reply_name, error_name) = names.borrow().clone().unwrap();
    rt.obtain(&error_name).post(&json!("defeat"));

    let (value, which) = got.borrow().clone().unwrap();
    assert_eq!(value, json!("defeat"));
    assert_eq!(which, Which::Error);
    assert_eq!(which.index(), 1);
    assert!(!rt.obtain(&reply_name).post(&json!("victory")));
}

#[test]
fn test_waiter_pair_with_exception() {
    let rt = runtime();
    let (got, sink) = slot();
    let (names, names_sink) = slot();

    rt.launch("race-waiter", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        *names_sink.borrow_mut() = Some(pair.name1().to_string());
        *sink.borrow_mut() = Some(pair.suspend_with_exception(&co, "rendezvous").await);
        Ok(())
    });

    let error_name = names.borrow().clone().unwrap();
    rt.obtain(&error_name).post(&json!("badness"));

    let result = got.borrow().clone().unwrap();
    match result {
        Err(EventError::ErrorEvent { context, data }) => {
            assert_eq!(context, "rendezvous");
            assert_eq!(data, json!("badness"));
        }
        other => panic!("expected an error event, got {other:?}"),
    }
}

#[test]
fn test_waiter_pair_with_log() {
    let rt = runtime();
    let (got, sink) = slot();
    let (names, names_sink) = slot();

    rt.launch("race-waiter", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        *names_sink.borrow_mut() = Some(pair.name1().to_string());
        *sink.borrow_mut() = Some(pair.suspend_with_log(&co, "rendezvous").await);
        Ok(())
    });

    let error_name = names.borrow().clone().unwrap();
    rt.obtain(&error_name).post(&json!("badness"));

    let err = got.borrow().clone().unwrap().unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("badness"));
}

#[test]
fn test_post_and_suspend_round_trip() {
    let rt = runtime();
    install_immediate_service(&rt, "api");
    let (got, sink) = slot();

    let handle = rt.launch("requester", move |co| async move {
        let reply = co
            .post_and_suspend(&json!({"value": 17}), "api", "reply1", "reply")
            .await;
        *sink.borrow_mut() = Some(reply);
        Ok(())
    });

    // The service replied inside the post, so the whole round trip
    // finished within launch
    assert_eq!(handle.state(), CoroState::Completed);
    assert_eq!(*got.borrow(), Some(json!(18)));
}

#[test]
fn test_waiter_post_and_suspend() {
    let rt = runtime();
    install_immediate_service(&rt, "api");
    let (got, sink) = slot();

    rt.launch("requester", move |co| async move {
        let wait = ReplyPump::new(&co.runtime());
        let reply = wait
            .post_and_suspend(&co, &json!({"value": 17}), "api", "reply")
            .await;
        *sink.borrow_mut() = Some(reply);
        Ok(())
    });

    assert_eq!(*got.borrow(), Some(json!(18)));
}

#[test]
fn test_waiter_pair_post_reply_side() {
    let rt = runtime();
    install_immediate_service(&rt, "api");
    let (got, sink) = slot();

    rt.launch("requester", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        let result = pair
            .post_and_suspend(&co, &json!({"value": 23}), "api", "reply", "error")
            .await;
        *sink.borrow_mut() = Some(result);
        Ok(())
    });

    assert_eq!(*got.borrow(), Some((json!(24), Which::Reply)));
}

#[test]
fn test_waiter_pair_post_error_side() {
    let rt = runtime();
    install_immediate_service(&rt, "api");
    let (got, sink) = slot();

    rt.launch("requester", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        let result = pair
            .post_and_suspend(
                &co,
                &json!({"value": 23, "fail": null}),
                "api",
                "reply",
                "error",
            )
            .await;
        *sink.borrow_mut() = Some(result);
        Ok(())
    });

    assert_eq!(*got.borrow(), Some((json!(24), Which::Error)));
}

#[test]
fn test_waiter_pair_post_first_answer_wins() {
    let rt = runtime();
    let (got, sink) = slot();
    let (late_handled, late_sink) = slot();
    let resumes = Rc::new(RefCell::new(0));

    // Overeager service answering on BOTH channels within one delivery;
    // only the first answer may reach the waiter
    let pumps = rt.pumps().clone();
    rt.obtain("api")
        .listen("double-service", move |request: &Value| {
            let error = request["error"].as_str().unwrap().to_string();
            let reply = request["reply"].as_str().unwrap().to_string();
            pumps.obtain(&error).post(&json!("first-error"));
            *late_sink.borrow_mut() = Some(pumps.obtain(&reply).post(&json!("late-reply")));
            true
        })
        .unwrap();

    let counter = resumes.clone();
    let handle = rt.launch("requester", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        let result = pair
            .post_and_suspend(&co, &json!({"value": 1}), "api", "reply", "error")
            .await;
        *counter.borrow_mut() += 1;
        *sink.borrow_mut() = Some(result);
        Ok(())
    });

    // The error post won and resumed the waiter exactly once; the reply
    // post found its listener already disabled
    assert_eq!(handle.state(), CoroState::Completed);
    assert_eq!(*resumes.borrow(), 1);
    assert_eq!(*got.borrow(), Some((json!("first-error"), Which::Error)));
    assert_eq!(*late_handled.borrow(), Some(false));
}

#[test]
fn test_waiter_pair_post_with_exception_success() {
    let rt = runtime();
    install_immediate_service(&rt, "api");
    let (got, sink) = slot();

    rt.launch("requester", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        let result = pair
            .post_and_suspend_with_exception(
                &co,
                &json!({"value": 8}),
                "api",
                "reply",
                "error",
                "request",
            )
            .await;
        *sink.borrow_mut() = Some(result);
        Ok(())
    });

    assert_eq!(got.borrow().clone().unwrap().unwrap(), json!(9));
}

#[test]
fn test_waiter_pair_post_with_exception_error() {
    let rt = runtime();
    install_immediate_service(&rt, "api");
    let (got, sink) = slot();
    let (normal, normal_sink) = slot();

    rt.launch("requester", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        let result = pair
            .post_and_suspend_with_exception(
                &co,
                &json!({"value": 9, "fail": null}),
                "api",
                "reply",
                "error",
                "request",
            )
            .await;
        // Only a successful reply reaches the normal-result slot
        if let Ok(value) = &result {
            *normal_sink.borrow_mut() = Some(value.clone());
        }
        *sink.borrow_mut() = Some(result);
        Ok(())
    });

    assert!(normal.borrow().is_none());
    let result = got.borrow().clone().unwrap();
    match result {
        Err(EventError::ErrorEvent { data, .. }) => assert_eq!(data, json!(10)),
        other => panic!("expected an error event, got {other:?}"),
    }
}

#[test]
fn test_waiter_pair_post_with_log_success() {
    let rt = runtime();
    install_immediate_service(&rt, "api");
    let (got, sink) = slot();

    rt.launch("requester", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        let result = pair
            .post_and_suspend_with_log(
                &co,
                &json!({"value": 30}),
                "api",
                "reply",
                "error",
                "request",
            )
            .await;
        *sink.borrow_mut() = Some(result);
        Ok(())
    });

    assert_eq!(got.borrow().clone().unwrap().unwrap(), json!(31));
}

#[test]
fn test_waiter_pair_post_with_log_error() {
    let rt = runtime();
    install_immediate_service(&rt, "api");
    let (got, sink) = slot();

    rt.launch("requester", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        let result = pair
            .post_and_suspend_with_log(
                &co,
                &json!({"value": 31, "fail": null}),
                "api",
                "reply",
                "error",
                "request",
            )
            .await;
        *sink.borrow_mut() = Some(result);
        Ok(())
    });

    let err = got.borrow().clone().unwrap().unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("32"));
}

#[test]
fn test_failure_escapes_to_runtime_handler() {
    let rt = runtime();
    install_immediate_service(&rt, "api");
    let (seen, seen_sink) = slot();

    rt.set_failure_handler(move |name, err| {
        *seen_sink.borrow_mut() = Some((name.to_string(), err.to_string()));
    });

    // The body propagates the error event instead of handling it
    let handle = rt.launch("careless", move |co| async move {
        let pair = ReplyPumps::new(&co.runtime());
        pair.post_and_suspend_with_exception(
            &co,
            &json!({"value": 12, "fail": null}),
            "api",
            "reply",
            "error",
            "careless-request",
        )
        .await?;
        Ok(())
    });

    assert_eq!(handle.state(), CoroState::Failed);
    let (name, message) = seen.borrow().clone().unwrap();
    assert_eq!(name, "careless");
    assert!(message.contains("careless-request"));
    assert!(message.contains("13"));
}

#[test]
fn test_obtain_is_idempotent() {
    let rt = runtime();
    let first = rt.obtain("shared");
    let second = rt.obtain("shared");
    assert_eq!(first, second);

    // Listeners registered through one handle fire for posts on the other
    let (got, sink) = slot();
    first
        .listen("watcher", move |value: &Value| {
            *sink.borrow_mut() = Some(value.clone());
            true
        })
        .unwrap();
    second.post(&json!(1));
    assert_eq!(*got.borrow(), Some(json!(1)));
}

#[test]
fn test_runtime_drop_frees_parked_race_pumps() {
    let (names, names_sink) = slot();

    let weak_pair = {
        let rt = runtime();
        rt.launch("race-waiter", move |co| async move {
            let pair = ReplyPumps::new(&co.runtime());
            *names_sink.borrow_mut() = Some((pair.name0().to_string(), pair.name1().to_string()));
            pair.suspend(&co).await;
            Ok(())
        });

        let (reply_name, error_name) = names.borrow().clone().unwrap();
        let weak = (
            rt.obtain(&reply_name).downgrade(),
            rt.obtain(&error_name).downgrade(),
        );
        assert!(weak.0.upgrade().is_some());
        assert!(weak.1.upgrade().is_some());
        weak
    };

    // Tearing the runtime down mid-wait frees the pump pair even though
    // each race listener refers to its sibling
    assert!(weak_pair.0.upgrade().is_none());
    assert!(weak_pair.1.upgrade().is_none());
}
