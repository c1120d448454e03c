//! Running many requests at once.
//!
//! Every request gets its own task. Tasks queue on the pool like any other caller, so the
//! number of requests on the wire per destination never exceeds the pool limit. Results come
//! back in the order the requests were given, whatever order they complete in.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt as _;
use tokio::task::JoinSet;
use tracing::{Instrument as _, warn};

use super::error::Error;
use super::executor::Executor;
use super::request::Request;
use super::response::Response;

/// Execute every request concurrently and collect the results in input order.
///
/// A failed request fills its own slot with the error; the rest are unaffected.
pub async fn bulk_execute<I>(executor: &Executor, requests: I) -> Vec<Result<Response, Error>>
where
    I: IntoIterator<Item = Request>,
{
    run(executor, requests.into_iter().map(Ok).collect()).await
}

/// Like [`bulk_execute`], with slots that already failed while the request was being built.
pub(crate) async fn run(
    executor: &Executor,
    requests: Vec<Result<Request, Error>>,
) -> Vec<Result<Response, Error>> {
    let span = tracing::debug_span!("batch", count = requests.len());
    let mut slots: Vec<Option<Result<Response, Error>>> = Vec::with_capacity(requests.len());
    slots.resize_with(requests.len(), || None);

    let mut tasks = JoinSet::new();
    for (index, request) in requests.into_iter().enumerate() {
        match request {
            Ok(request) => {
                let executor = executor.clone();
                tasks.spawn(
                    async move {
                        let result = AssertUnwindSafe(executor.execute(request))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| Err(Error::TaskFailed(panic_message(&*panic))));
                        (index, result)
                    }
                    .instrument(span.clone()),
                );
            }
            Err(error) => slots[index] = Some(Err(error)),
        }
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(error) => warn!(parent: &span, %error, "batch task did not complete"),
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(Error::TaskFailed("task cancelled".into()))))
        .collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use http::Method;

    use crate::client::config::SessionConfig;
    use crate::client::conn::{Connector, GaiResolver, TcpTransport};
    use crate::client::cookies::CookieJar;
    use crate::client::pool::{Config as PoolConfig, Pool};
    use crate::client::request::RequestOptions;
    use crate::fixtures::{RecordedRequest, Reply, TestServer};

    fn executor(max: usize) -> Executor {
        let config = SessionConfig {
            pool: PoolConfig {
                max_connections_per_host: max,
                ..PoolConfig::default()
            },
            ..SessionConfig::default()
        };
        let connector = Connector::new(Arc::new(GaiResolver::new()), TcpTransport::default());
        let pool = Pool::new(config.pool.clone(), connector);
        Executor::new(pool, Arc::new(CookieJar::new()), Arc::new(config))
    }

    fn echo(request: &RecordedRequest) -> Reply {
        let delay = if request.target.ends_with('0') { 30 } else { 0 };
        Reply::ok(request.target.clone()).delay(std::time::Duration::from_millis(delay))
    }

    fn get(url: &str) -> Request {
        Request::new(Method::GET, url, RequestOptions::new()).unwrap()
    }

    #[tokio::test]
    async fn results_keep_input_order() {
        let server = TestServer::start(echo).await;
        let executor = executor(4);

        let requests: Vec<_> = (0..20).map(|i| get(&server.url(&format!("/item/{i}")))).collect();
        let results = bulk_execute(&executor, requests).await;

        assert_eq!(results.len(), 20);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap().text(), format!("/item/{i}"));
        }
        assert!(server.connections() <= 4, "opened {}", server.connections());
    }

    #[tokio::test]
    async fn failures_stay_in_their_slots() {
        let server = TestServer::start(echo).await;
        let refused = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let executor = executor(2);

        let mut requests = Vec::new();
        for i in 0..9 {
            let request = match i % 3 {
                0 => Ok(get(&server.url(&format!("/ok/{i}")))),
                1 => Ok(get(&format!("http://{refused}/down"))),
                _ => Err(Error::InvalidRequest(format!("bad {i}"))),
            };
            requests.push(request);
        }

        let results = run(&executor, requests).await;
        assert_eq!(results.len(), 9);
        for (i, result) in results.iter().enumerate() {
            match i % 3 {
                0 => assert_eq!(result.as_ref().unwrap().text(), format!("/ok/{i}")),
                1 => assert!(result.as_ref().unwrap_err().is_connect(), "{result:?}"),
                _ => assert!(matches!(result, Err(Error::InvalidRequest(m)) if *m == format!("bad {i}"))),
            }
        }
    }

    #[tokio::test]
    async fn empty_batch() {
        let executor = executor(1);
        assert!(bulk_execute(&executor, Vec::new()).await.is_empty());
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&42_u8), "panicked");
    }
}
