use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::*;
use crate::loader::ManualFetcher;

type Log = Arc<Mutex<Vec<String>>>;

fn setup() -> (Resolver<ManualFetcher>, ManualFetcher) {
    let fetcher = ManualFetcher::new();
    (Resolver::new(fetcher.clone()), fetcher)
}

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn ok(_: Arguments) -> anyhow::Result<Exports> {
    Ok(Exports::none())
}

#[test]
fn test_require_after_define() {
    let (mut resolver, fetcher) = setup();
    let seen = Arc::new(Mutex::new(None));

    resolver.define(Definition::named("a").value(1_i32)).unwrap();
    assert_eq!(resolver.state("a"), Some(State::Executed));

    let sink = seen.clone();
    resolver
        .require(["a"], move |args| {
            *sink.lock().unwrap() = args.get::<i32>(0).copied();
            Ok(Exports::none())
        })
        .unwrap();
    resolver.run_until_idle();

    assert_eq!(*seen.lock().unwrap(), Some(1));
    assert!(fetcher.requested().is_empty(), "defined modules are never fetched");
}

#[test]
fn test_fetch_failure_propagates() {
    let (mut resolver, fetcher) = setup();
    let events = log();

    let (on_ready, on_error) = (events.clone(), events.clone());
    resolver
        .define(
            Definition::named("b")
                .depends_on(["a"])
                .on_ready(move |_| {
                    on_ready.lock().unwrap().push("ready".into());
                    Ok(Exports::none())
                })
                .on_error(move |error| {
                    on_error.lock().unwrap().push(error.root().to_string());
                }),
        )
        .unwrap();

    assert_eq!(resolver.state("a"), Some(State::Fetching));
    assert!(fetcher.fail("a", anyhow::anyhow!("404")));
    resolver.run_until_idle();

    assert_eq!(resolver.state("a"), Some(State::Error));
    assert_eq!(resolver.state("b"), Some(State::Error));

    let events = entries(&events);
    assert_eq!(events.len(), 1);
    assert!(events[0].starts_with("Couldn't fetch module 'a'."));
}

#[test]
fn test_shared_fetch() {
    let (mut resolver, fetcher) = setup();
    let events = log();

    for (label, dependencies) in [("first", vec!["a", "c"]), ("second", vec!["a"])] {
        let sink = events.clone();
        resolver
            .require(dependencies, move |args| {
                let value = args.get::<i32>(0).copied().unwrap_or_default();
                sink.lock().unwrap().push(format!("{label}:{value}"));
                Ok(Exports::none())
            })
            .unwrap();
    }

    resolver.run_until_idle();
    assert_eq!(fetcher.requested(), vec!["a", "c"]);

    fetcher.define("a", Definition::new().value(5_i32));
    resolver.run_until_idle();
    assert_eq!(entries(&events), vec!["second:5"]);

    fetcher.define("c", Definition::new().value(()));
    resolver.run_until_idle();

    assert_eq!(entries(&events), vec!["second:5", "first:5"]);
    assert_eq!(fetcher.requested(), vec!["a", "c"]);
}

#[test]
fn test_cycle_defined_directly() {
    let (mut resolver, _fetcher) = setup();
    let events = log();

    let sink = events.clone();
    resolver
        .define(Definition::named("x").depends_on(["y"]).on_ready(move |args| {
            let y = args.get::<&str>(0).copied().unwrap_or("undefined");
            sink.lock().unwrap().push(format!("x sees {y}"));
            Ok(Exports::new("x"))
        }))
        .unwrap();

    let sink = events.clone();
    resolver
        .define(Definition::named("y").depends_on(["x"]).on_ready(move |args| {
            let x = match args.is_undefined(0) {
                true => "undefined",
                false => "x",
            };
            sink.lock().unwrap().push(format!("y sees {x}"));
            Ok(Exports::new("y"))
        }))
        .unwrap();

    resolver.run_until_idle();

    assert_eq!(entries(&events), vec!["y sees undefined", "x sees y"]);
    for name in ["x", "y"] {
        let report = resolver.module(name).unwrap();
        assert_eq!(report.state, State::Executed);
        assert_eq!(report.pending, 0);
    }
}

#[test]
fn test_cycle_through_fetches() {
    let (mut resolver, fetcher) = setup();
    let done = Arc::new(Mutex::new(false));

    let flag = done.clone();
    resolver
        .require(["x"], move |_| {
            *flag.lock().unwrap() = true;
            Ok(Exports::none())
        })
        .unwrap();
    resolver.run_until_idle();

    fetcher.define("x", Definition::new().depends_on(["y"]).value("x"));
    resolver.run_until_idle();
    fetcher.define("y", Definition::new().depends_on(["x"]).value("y"));
    resolver.run_until_idle();

    assert!(*done.lock().unwrap());
    assert_eq!(resolver.state("x"), Some(State::Executed));
    assert_eq!(resolver.state("y"), Some(State::Executed));
    assert!(resolver.diagnostics().stalled().next().is_none());
}

#[test]
fn test_self_dependency_does_not_deadlock() {
    let (mut resolver, _fetcher) = setup();

    resolver
        .define(Definition::named("s").depends_on(["s"]).on_ready(|args| {
            assert!(args.is_undefined(0));
            Ok(Exports::new(()))
        }))
        .unwrap();

    assert_eq!(resolver.state("s"), Some(State::Executed));
}

#[test]
fn test_sentinel_injects_require() {
    let (mut resolver, fetcher) = setup();
    let events = log();

    let sink = events.clone();
    let task = resolver
        .require(["require", "a"], move |args| {
            assert!(matches!(args.argument(0), Some(Argument::Require(_))));
            let require = args.require().cloned().ok_or_else(|| anyhow::anyhow!("no require"))?;

            let inner = sink.clone();
            require.require(["b"], move |args| {
                let b = args.get::<i32>(0).copied().unwrap_or_default();
                inner.lock().unwrap().push(format!("b={b}"));
                Ok(Exports::none())
            })?;

            sink.lock().unwrap().push("outer".into());
            Ok(Exports::none())
        })
        .unwrap();

    resolver.run_until_idle();

    let report = resolver.inspect(task).unwrap();
    assert_eq!(report.pending, 1, "the sentinel is not awaited");
    assert!(report.requires_self_reference);
    assert_eq!(fetcher.requested(), vec!["a"]);

    fetcher.define("a", Definition::new().value(1_i32));
    resolver.run_until_idle();
    assert_eq!(entries(&events), vec!["outer"]);
    assert_eq!(fetcher.requested(), vec!["a", "b"]);

    fetcher.define("b", Definition::new().value(2_i32));
    resolver.run_until_idle();
    assert_eq!(entries(&events), vec!["outer", "b=2"]);
}

#[test]
fn test_notification_is_deferred() {
    let (mut resolver, fetcher) = setup();

    let task = resolver.require(["a"], ok).unwrap();
    resolver.tick();
    assert_eq!(resolver.state_of(task), Some(State::Fetched));

    fetcher.define("a", Definition::new().value(1_i32));
    resolver.tick();
    assert_eq!(resolver.state("a"), Some(State::Executed));
    assert_eq!(resolver.state_of(task), Some(State::Fetched));

    resolver.tick();
    assert_eq!(resolver.state_of(task), Some(State::Executed));
}

#[test]
fn test_empty_request_runs_next_turn() {
    let (mut resolver, _fetcher) = setup();

    let task = resolver.require(Vec::<String>::new(), ok).unwrap();
    assert_eq!(resolver.state_of(task), Some(State::Fetched));

    resolver.tick();
    assert_eq!(resolver.state_of(task), Some(State::Executed));
}

#[test]
fn test_redefine_is_ignored() {
    let (mut resolver, _fetcher) = setup();

    let first = resolver.define(Definition::named("a").value(1_i32)).unwrap();
    let second = resolver.define(Definition::named("a").value(2_i32)).unwrap();

    assert_eq!(first, second);
    assert_eq!(resolver.get::<i32>("a"), Some(&1));
}

#[test]
fn test_config_errors_are_synchronous() {
    let (mut resolver, fetcher) = setup();

    assert!(matches!(
        resolver.define(Definition::new().value(1)),
        Err(ConfigError::AnonymousDefine)
    ));
    assert!(matches!(
        resolver.define(Definition::named("a")),
        Err(ConfigError::MissingCallback)
    ));
    assert!(matches!(
        resolver.define(Definition::named("require").value(1)),
        Err(ConfigError::ReservedName(_))
    ));
    assert!(matches!(
        resolver.require(["a", ""], ok),
        Err(ConfigError::EmptyDependency { position: 1 })
    ));
    assert!(matches!(
        resolver.request(Definition::named("a").value(1)),
        Err(ConfigError::NamedRequest(_))
    ));
    assert!(matches!(
        resolver.listen(["require"], |_| {}),
        Err(ConfigError::ReservedName(_))
    ));

    assert_eq!(resolver.run_until_idle(), 0);
    assert!(fetcher.requested().is_empty());
    assert!(resolver.diagnostics().units.is_empty());
}

#[test]
fn test_panicking_callback_fails_unit() {
    let (mut resolver, _fetcher) = setup();
    let failure = Arc::new(Mutex::new(None));

    let sink = failure.clone();
    resolver
        .define(
            Definition::named("a")
                .on_ready(|_| panic!("boom"))
                .on_error(move |error| *sink.lock().unwrap() = Some(error.clone())),
        )
        .unwrap();

    assert_eq!(resolver.state("a"), Some(State::Error));
    match failure.lock().unwrap().take() {
        Some(ResolveError::Execution { unit, error }) => {
            assert_eq!(unit, "module 'a'");
            assert!(error.to_string().contains("boom"));
        }
        other => panic!("unexpected failure: {other:?}"),
    }
}

#[test]
fn test_execution_error_chain() {
    let (mut resolver, _fetcher) = setup();
    let failure = Arc::new(Mutex::new(None));

    resolver
        .define(Definition::named("a").on_ready(|_| anyhow::bail!("bad config")))
        .unwrap();
    resolver
        .define(Definition::named("b").depends_on(["a"]).on_ready(ok))
        .unwrap();

    let sink = failure.clone();
    resolver
        .request(
            Definition::new()
                .depends_on(["b"])
                .on_ready(ok)
                .on_error(move |error| *sink.lock().unwrap() = Some(error.clone())),
        )
        .unwrap();
    resolver.run_until_idle();

    assert_eq!(resolver.state("b"), Some(State::Error));

    let failure = failure.lock().unwrap().take().unwrap();
    assert!(matches!(failure, ResolveError::Dependency { ref dependency, .. } if dependency == "b"));
    assert!(matches!(
        failure.root(),
        ResolveError::Execution { unit, .. } if unit == "module 'a'"
    ));
}

#[test]
fn test_failed_dependency_rejects_late_subscriber() {
    let (mut resolver, fetcher) = setup();
    let failed = Arc::new(Mutex::new(false));

    resolver.require(["a"], ok).unwrap();
    resolver.run_until_idle();
    fetcher.fail("a", anyhow::anyhow!("offline"));
    resolver.run_until_idle();
    assert_eq!(resolver.state("a"), Some(State::Error));

    let flag = failed.clone();
    let task = resolver
        .request(
            Definition::new()
                .depends_on(["a"])
                .on_ready(ok)
                .on_error(move |_| *flag.lock().unwrap() = true),
        )
        .unwrap();
    resolver.run_until_idle();

    assert!(*failed.lock().unwrap());
    assert_eq!(resolver.state_of(task), Some(State::Error));
    assert_eq!(fetcher.requested(), vec!["a"]);
}

#[test]
fn test_listen() {
    let (mut resolver, fetcher) = setup();
    let events = log();

    let sink = events.clone();
    resolver
        .listen(["b", "a"], move |args| {
            let b = args.get::<i32>(0).copied().unwrap_or_default();
            let a = args.get::<i32>(1).copied().unwrap_or_default();
            sink.lock().unwrap().push(format!("{b},{a}"));
        })
        .unwrap();
    resolver.run_until_idle();
    assert_eq!(fetcher.pending(), vec!["a", "b"]);

    fetcher.define("a", Definition::new().value(1_i32));
    resolver.run_until_idle();
    assert!(entries(&events).is_empty());

    fetcher.define("b", Definition::new().value(2_i32));
    resolver.run_until_idle();
    assert_eq!(entries(&events), vec!["2,1"]);
}

#[test]
fn test_listen_on_executed_modules() {
    let (mut resolver, _fetcher) = setup();
    let called = Arc::new(Mutex::new(false));

    resolver.define(Definition::named("a").value(1_i32)).unwrap();
    resolver.run_until_idle();

    let flag = called.clone();
    resolver
        .listen(["a"], move |_| *flag.lock().unwrap() = true)
        .unwrap();
    assert!(!*called.lock().unwrap());

    resolver.run_until_idle();
    assert!(*called.lock().unwrap());
}

#[test]
fn test_listen_failure() {
    let (mut resolver, fetcher) = setup();
    let events = log();

    let (success, failure) = (events.clone(), events.clone());
    resolver
        .listen_or_else(
            ["a", "b"],
            move |_| success.lock().unwrap().push("success".into()),
            move || failure.lock().unwrap().push("failure".into()),
        )
        .unwrap();
    resolver.run_until_idle();

    fetcher.fail("a", anyhow::anyhow!("timeout"));
    resolver.run_until_idle();
    fetcher.define("b", Definition::new().value(()));
    resolver.run_until_idle();

    assert_eq!(entries(&events), vec!["failure"]);
}

#[test]
fn test_plain_script_is_undefined() {
    let (mut resolver, fetcher) = setup();
    let undefined = Arc::new(Mutex::new(false));

    let flag = undefined.clone();
    resolver
        .require(["plain"], move |args| {
            *flag.lock().unwrap() = args.is_undefined(0);
            Ok(Exports::none())
        })
        .unwrap();
    resolver.run_until_idle();

    fetcher.succeed("plain");
    resolver.run_until_idle();

    assert!(*undefined.lock().unwrap());
    assert_eq!(resolver.state("plain"), Some(State::Executed));
    assert!(resolver.exports("plain").is_none());
}

#[test]
fn test_abandoned_fetch_fails() {
    let (mut resolver, fetcher) = setup();

    resolver.require(["a"], ok).unwrap();
    resolver.run_until_idle();
    assert_eq!(resolver.in_flight(), 1);

    drop(fetcher.take("a"));
    resolver.run_until_idle();

    assert_eq!(resolver.state("a"), Some(State::Error));
    assert_eq!(resolver.in_flight(), 0);
}

#[test]
fn test_repeated_dependency() {
    let (mut resolver, fetcher) = setup();
    let runs = Arc::new(Mutex::new(0));

    let counter = runs.clone();
    let task = resolver
        .require(["a", "a"], move |args| {
            assert_eq!(args.get::<i32>(0), args.get::<i32>(1));
            *counter.lock().unwrap() += 1;
            Ok(Exports::none())
        })
        .unwrap();
    resolver.run_until_idle();
    assert_eq!(resolver.inspect(task).unwrap().pending, 2);

    fetcher.define("a", Definition::new().value(3_i32));
    resolver.run_until_idle();

    assert_eq!(*runs.lock().unwrap(), 1);
    assert_eq!(resolver.inspect(task).unwrap().pending, 0);
}

#[test]
fn test_aliases() {
    let fetcher = ManualFetcher::new();
    let options = Options {
        aliases: BTreeMap::from([("jq".to_string(), "jquery".to_string())]),
        ..Options::default()
    };
    let mut resolver = Resolver::with_options(fetcher.clone(), options);

    resolver.require(["jq"], ok).unwrap();
    resolver.run_until_idle();
    assert_eq!(fetcher.requested(), vec!["jquery"]);

    fetcher.define("jquery", Definition::new().value("$"));
    resolver.run_until_idle();

    assert_eq!(resolver.state("jq"), Some(State::Executed));
    assert_eq!(resolver.get::<&str>("jquery"), Some(&"$"));
}

#[test]
fn test_alias_onto_sentinel_is_ignored() {
    let fetcher = ManualFetcher::new();
    let options = Options {
        aliases: BTreeMap::from([("r".to_string(), "require".to_string())]),
        ..Options::default()
    };
    let mut resolver = Resolver::with_options(fetcher.clone(), options);
    let events = log();

    let sink = events.clone();
    resolver
        .listen(["r"], move |args| {
            let value = args.get::<i32>(0).copied().unwrap_or_default();
            sink.lock().unwrap().push(format!("listen:{value}"));
        })
        .unwrap();

    let sink = events.clone();
    resolver
        .require(["r"], move |args| {
            let injected = args.require().is_some();
            sink.lock().unwrap().push(format!("require:{injected}"));
            Ok(Exports::none())
        })
        .unwrap();
    resolver.run_until_idle();

    assert_eq!(fetcher.requested(), vec!["r"]);
    assert_eq!(resolver.state("require"), None);

    fetcher.define("r", Definition::new().value(7_i32));
    resolver.run_until_idle();

    let mut events = entries(&events);
    events.sort();
    assert_eq!(events, vec!["listen:7", "require:false"]);
}

#[test]
fn test_argument_order_ignores_completion_order() {
    let (mut resolver, fetcher) = setup();
    let events = log();

    let sink = events.clone();
    resolver
        .require(["a", "b", "c"], move |args| {
            let values: Vec<String> = (0..args.len())
                .map(|i| args.get::<i32>(i).map_or("?".into(), ToString::to_string))
                .collect();
            sink.lock().unwrap().push(values.join(","));
            Ok(Exports::none())
        })
        .unwrap();
    resolver.run_until_idle();
    assert_eq!(fetcher.requested(), vec!["a", "b", "c"]);

    for (name, value) in [("c", 3_i32), ("b", 2), ("a", 1)] {
        fetcher.define(name, Definition::new().value(value));
        resolver.run_until_idle();
    }

    assert_eq!(entries(&events), vec!["1,2,3"]);
}

#[test]
fn test_diagnostics_show_waits() {
    let (mut resolver, _fetcher) = setup();

    let task = resolver.require(["a"], ok).unwrap();
    resolver.run_until_idle();

    let a = resolver.module("a").unwrap();
    let diagnostics = resolver.diagnostics();

    assert_eq!(diagnostics.units.len(), 2);
    assert_eq!(diagnostics.stalled().count(), 2);
    assert_eq!(resolver.inspect(task).unwrap().waiting_on, vec![a.id]);
    assert!(
        diagnostics
            .render_mermaid()
            .contains(&format!("u{} --> u{}", task.get(), a.id.get()))
    );
}
