use super::{full_body, BoxBody, BridgeState};
use crate::pool::SelectionStrategy;
use crate::store::Provider;
use http::Method;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};

pub async fn handle_admin(
    req: Request<Incoming>,
    state: BridgeState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let is_post = req.method() == Method::POST;
    let path = req.uri().path().to_string();

    match path.as_str() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let tavily_keys = state.store.count_keys(Provider::Tavily).await.unwrap_or(0);
            let brave_keys = state.store.count_keys(Provider::Brave).await.unwrap_or(0);
            Ok(Response::builder()
                .status(200)
                .body(full_body(format!(
                    r#"{{"status":"ready","tavily_keys":{},"brave_keys":{},"sessions":{}}}"#,
                    tavily_keys,
                    brave_keys,
                    state.sessions.len(),
                )))
                .unwrap())
        }

        "/metrics" => {
            let body = match &state.metrics {
                Some(metrics) => metrics.render(),
                None => String::new(),
            };
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        // Runtime swap of the key-selection strategy:
        //   POST /strategy {"strategy": "random"}
        "/strategy" if is_post => {
            let body = req.into_body().collect().await?.to_bytes();
            let tag = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| {
                    v.get("strategy")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string)
                });
            let Some(tag) = tag else {
                return Ok(Response::builder()
                    .status(400)
                    .body(full_body(r#"{"error":"strategy field required"}"#))
                    .unwrap());
            };
            let Some(pool) = &state.tavily_pool else {
                return Ok(Response::builder()
                    .status(409)
                    .body(full_body(r#"{"error":"no key pool configured"}"#))
                    .unwrap());
            };
            let strategy = SelectionStrategy::parse(&tag);
            pool.set_strategy(strategy);
            Ok(Response::builder()
                .status(200)
                .body(full_body(format!(
                    r#"{{"status":"ok","strategy":"{}"}}"#,
                    strategy.as_str()
                )))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
