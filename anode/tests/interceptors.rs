use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anode::{
    AsyncNext, BoxInterceptor, CachingInterceptor, Container, ContainerOptions, Instance,
    Interceptor, LoggingInterceptor, Middleware, Next, Provider, ResolutionContext, ResolveError,
    ResolveOptions, ResolveResult, RetryInterceptor, Scope, StdError, ValidationInterceptor,
    compose, from_hooks, when,
};

type Log = Arc<Mutex<Vec<String>>>;

struct Recording {
    name: &'static str,
    log: Log,
}

impl Recording {
    fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: log.clone(),
        }
    }

    fn push(&self, stage: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} {stage}", self.name));
    }
}

impl Interceptor for Recording {
    fn intercept(&self, _ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
        self.push("before");
        let result = next.run();
        self.push("after");
        result
    }

    async fn intercept_async(
        &self,
        _ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance> {
        self.push("before");
        let result = next.run().await;
        self.push("after");
        result
    }
}

struct AsyncOnly;

impl Interceptor for AsyncOnly {
    async fn intercept_async(
        &self,
        _ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance> {
        tokio::task::yield_now().await;
        next.run().await
    }
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn flaky(failures: usize, calls: &Arc<AtomicUsize>) -> Provider {
    let calls = calls.clone();
    Provider::new("flaky")
        .use_factory([], move |_| -> Result<u32, StdError> {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            if call < failures {
                Err(format!("attempt {call} failed").into())
            } else {
                Ok(7)
            }
        })
        .scope(Scope::Transient)
}

#[test]
fn test_interceptor_order() {
    let log = Log::default();
    let container = Container::new();
    container
        .add_provider(
            Provider::new("value")
                .use_value(1u32)
                .interceptor(Recording::new("outer", &log))
                .interceptor(Recording::new("inner", &log)),
        )
        .unwrap();

    container.resolve::<u32>("value").unwrap();
    assert_eq!(
        entries(&log),
        vec!["outer before", "inner before", "inner after", "outer after"]
    );
}

#[tokio::test]
async fn test_interceptor_order_async() {
    let log = Log::default();
    let container = Container::new();
    container
        .add_provider(
            Provider::new("value")
                .use_async(|| async { Ok(1u32) })
                .interceptor(Recording::new("outer", &log))
                .interceptor(Recording::new("inner", &log)),
        )
        .unwrap();

    container.resolve_async::<u32>("value").await.unwrap();
    assert_eq!(
        entries(&log),
        vec!["outer before", "inner before", "inner after", "outer after"]
    );
}

#[test]
fn test_default_interceptors() {
    let log = Log::default();
    let options = ContainerOptions::new().interceptor(Recording::new("default", &log));
    let container = Container::with_options(options);
    container
        .add_providers([
            Provider::new("plain").use_value(1u32),
            Provider::new("local")
                .use_value(2u32)
                .interceptor(Recording::new("local", &log)),
        ])
        .unwrap();

    container.resolve::<u32>("plain").unwrap();
    container.resolve::<u32>("local").unwrap();
    assert_eq!(
        entries(&log),
        vec![
            "default before",
            "default after",
            "local before",
            "local after"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_caching_interceptor_ttl() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let container = Container::new();
    container
        .add_provider(
            Provider::new("report")
                .use_factory([], move |_| Ok(counter.fetch_add(1, Ordering::SeqCst)))
                .scope(Scope::Transient)
                .interceptor(CachingInterceptor::new(Duration::from_secs(5))),
        )
        .unwrap();

    let first = container.resolve_async::<usize>("report").await.unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;
    let second = container.resolve_async::<usize>("report").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(3)).await;
    let third = container.resolve_async::<usize>("report").await.unwrap();
    assert_eq!(*third, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_caching_interceptor_per_request() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let caching = Arc::new(CachingInterceptor::new(Duration::from_secs(60)));
    let container = Container::new();
    container
        .add_provider(
            Provider::new("report")
                .use_factory([], move |_| Ok(counter.fetch_add(1, Ordering::SeqCst)))
                .scope(Scope::Transient)
                .interceptor(caching.clone()),
        )
        .unwrap();

    for request in ["r1", "r1", "r2"] {
        container
            .get("report", &ResolveOptions::new().request(request))
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(caching.cache().len(), 2);
}

#[test]
fn test_validation_interceptor() {
    let container = Container::new();
    container
        .add_providers([
            Provider::new("port")
                .use_value(80u16)
                .interceptor(ValidationInterceptor::typed::<u16, _>(|port| {
                    if *port >= 1024 {
                        Ok(())
                    } else {
                        Err(format!("port {port} is privileged"))
                    }
                })),
            Provider::new("name")
                .use_value(String::from("anode"))
                .interceptor(ValidationInterceptor::typed::<u16, _>(|_| Ok(()))),
        ])
        .unwrap();

    let err = container.resolve::<u16>("port").err().unwrap();
    match err {
        ResolveError::Validation { reason, .. } => assert_eq!(reason, "port 80 is privileged"),
        err => panic!("unexpected error: {err}"),
    }
    let err = container.resolve::<String>("name").err().unwrap();
    assert!(matches!(err, ResolveError::Validation { .. }));
}

#[test]
fn test_retry_interceptor() {
    let calls = Arc::new(AtomicUsize::new(0));
    let container = Container::new();
    container
        .add_provider(flaky(2, &calls).interceptor(RetryInterceptor::new(3, Duration::ZERO)))
        .unwrap();
    assert_eq!(*container.resolve::<u32>("flaky").unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let calls = Arc::new(AtomicUsize::new(0));
    let container = Container::new();
    container
        .add_provider(flaky(5, &calls).interceptor(RetryInterceptor::new(2, Duration::ZERO)))
        .unwrap();
    let err = container.resolve::<u32>("flaky").err().unwrap();
    assert!(matches!(err, ResolveError::Production { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_interceptor_async() {
    let calls = Arc::new(AtomicUsize::new(0));
    let container = Container::new();
    container
        .add_provider(
            flaky(1, &calls).interceptor(RetryInterceptor::new(2, Duration::from_millis(100))),
        )
        .unwrap();
    assert_eq!(*container.resolve_async::<u32>("flaky").await.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_retry_skips_missing_provider() {
    let container = Container::new();
    container
        .add_provider(
            Provider::new("service")
                .use_factory([anode::Dependency::new("missing")], |_| Ok(()))
                .interceptor(RetryInterceptor::new(3, Duration::ZERO)),
        )
        .unwrap();

    let err = container.resolve::<()>("service").err().unwrap();
    assert!(err.is_missing_provider());
}

#[test]
fn test_hook_interceptor() {
    let container = Container::new();
    container
        .add_provider(
            Provider::new("greeting")
                .use_value(String::from("hello"))
                .interceptor(from_hooks(
                    |ctx| {
                        if ctx.get_metadata("deny").is_some() {
                            Err("denied".into())
                        } else {
                            Ok(())
                        }
                    },
                    |_, instance| {
                        let value = instance.downcast_ref::<String>().cloned().unwrap_or_default();
                        Ok(Arc::new(value.to_uppercase()) as Instance)
                    },
                ))
                .scope(Scope::Transient),
        )
        .unwrap();

    assert_eq!(container.resolve::<String>("greeting").unwrap().as_str(), "HELLO");

    let err = container
        .get("greeting", &ResolveOptions::new().metadata("deny", true))
        .err()
        .unwrap();
    assert!(matches!(err, ResolveError::Production { .. }));
}

#[test]
fn test_composed_and_conditional_interceptors() {
    let log = Log::default();
    let composed = compose([
        BoxInterceptor::new(Recording::new("first", &log)),
        BoxInterceptor::new(when(
            |ctx| ctx.request_id.is_some(),
            Recording::new("request", &log),
        )),
    ]);
    let container = Container::new();
    container
        .add_provider(
            Provider::new("value")
                .use_factory([], |_| Ok(1u32))
                .scope(Scope::Transient)
                .interceptor(composed)
                .interceptor(Recording::new("last", &log)),
        )
        .unwrap();

    container.resolve::<u32>("value").unwrap();
    assert_eq!(
        entries(&log),
        vec!["first before", "last before", "last after", "first after"]
    );

    log.lock().unwrap().clear();
    container
        .get("value", &ResolveOptions::new().request("r1"))
        .unwrap();
    assert_eq!(
        entries(&log),
        vec![
            "first before",
            "request before",
            "last before",
            "last after",
            "request after",
            "first after"
        ]
    );
}

#[tokio::test]
async fn test_async_interceptor_in_sync_path() {
    let container = Container::new();
    container
        .add_provider(Provider::new("value").use_value(1u32).interceptor(AsyncOnly))
        .unwrap();

    let err = container.resolve::<u32>("value").err().unwrap();
    assert!(matches!(
        err,
        ResolveError::AsyncInSyncPath {
            what: "interceptor",
            ..
        }
    ));
    assert_eq!(*container.resolve_async::<u32>("value").await.unwrap(), 1);
}

#[test]
fn test_logging_interceptor() {
    let container = Container::new();
    container
        .add_provider(
            Provider::new("value")
                .use_value(1u32)
                .interceptor(LoggingInterceptor::new()),
        )
        .unwrap();
    assert_eq!(*container.resolve::<u32>("value").unwrap(), 1);
}

#[test]
fn test_middleware_order() {
    let log = Log::default();
    let container = Container::new();
    for (name, priority) in [("audit", 10), ("auth", 1), ("trace", 10)] {
        let before = log.clone();
        let after = log.clone();
        container.use_middleware(
            Middleware::new(name)
                .priority(priority)
                .before(move |_| {
                    before.lock().unwrap().push(format!("{name} before"));
                    Ok(())
                })
                .after(move |_, instance| {
                    after.lock().unwrap().push(format!("{name} after"));
                    Ok(instance)
                }),
        );
    }
    container
        .add_provider(Provider::new("value").use_value(1u32))
        .unwrap();

    container.resolve::<u32>("value").unwrap();
    assert_eq!(
        entries(&log),
        vec![
            "auth before",
            "audit before",
            "trace before",
            "trace after",
            "audit after",
            "auth after"
        ]
    );

    // Cache hits bypass middleware.
    log.lock().unwrap().clear();
    container.resolve::<u32>("value").unwrap();
    assert!(entries(&log).is_empty());
}

#[test]
fn test_middleware_transforms_and_rejects() {
    let container = Container::new();
    container.use_middleware(Middleware::new("double").after(|_, instance| {
        match instance.downcast::<u32>() {
            Ok(v) => Ok(Arc::new(*v * 2) as Instance),
            Err(instance) => Ok(instance),
        }
    }));
    container.use_middleware(Middleware::new("guard").before(|ctx| {
        if ctx.token.describe() == "forbidden" {
            Err("access denied".into())
        } else {
            Ok(())
        }
    }));
    container
        .add_providers([
            Provider::new("value").use_value(21u32),
            Provider::new("forbidden").use_value(0u32),
        ])
        .unwrap();

    assert_eq!(*container.resolve::<u32>("value").unwrap(), 42);
    let err = container.resolve::<u32>("forbidden").err().unwrap();
    assert!(matches!(err, ResolveError::Production { .. }));
}

#[tokio::test]
async fn test_async_middleware() {
    let container = Container::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    container.use_middleware(Middleware::new("async").before_async(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));
    container
        .add_provider(
            Provider::new("value")
                .use_factory([], |_| Ok(1u32))
                .scope(Scope::Transient),
        )
        .unwrap();

    let err = container.resolve::<u32>("value").err().unwrap();
    assert!(matches!(err, ResolveError::AsyncInSyncPath { .. }));
    assert_eq!(seen.load(Ordering::SeqCst), 0);

    container.resolve_async::<u32>("value").await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
