use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;
use warp::Filter;

use super::with_orchestrator;
use crate::events::RenderEvent;
use crate::orchestrator::Orchestrator;

pub fn sse_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("events")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<HashMap<String, String>>())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_sse)
}

fn matches(event: &RenderEvent, task_id: Option<&str>) -> bool {
  match task_id {
    Some(id) => event.task_id() == Some(id),
    None => true,
  }
}

async fn handle_sse(query: HashMap<String, String>, orchestrator: Arc<Orchestrator>) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = query.get("task_id").cloned();
  let stream = BroadcastStream::new(orchestrator.subscribe()).filter_map(move |received| {
    let event = match received {
      Ok(event) => event,
      Err(e) => {
        debug!("SSE subscriber lagged: {}", e);
        return None;
      }
    };
    if !matches(&event, task_id.as_deref()) {
      return None;
    }
    warp::sse::Event::default()
      .event(event.kind())
      .json_data(&event)
      .ok()
      .map(Ok::<_, Infallible>)
  });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
