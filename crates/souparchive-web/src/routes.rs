use axum::Router;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use maud::{DOCTYPE, Markup, html};
use souparchive_core::ArchiveRecord;
use tracing::debug;

use crate::{LOG_TARGET, SharedState};

#[derive(Clone, Debug)]
#[must_use]
pub struct Maud(pub Markup);

impl IntoResponse for Maud {
    fn into_response(self) -> Response {
        (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            )],
            self.0.0,
        )
            .into_response()
    }
}

pub fn route_handler(state: SharedState) -> Router {
    Router::new()
        .route("/", get(get_index))
        .route("/list.txt", get(get_list))
        .with_state(state)
}

/// Href of a payload served under `/files`
///
/// File names are taken verbatim from url paths and may already contain
/// percent escapes, which the file service would decode again.
pub(crate) fn file_href(filename: &str) -> String {
    format!("/files/{}", filename.replace('%', "%25"))
}

async fn get_index(State(state): State<SharedState>) -> Maud {
    let store = state.load_archive().await;
    let records = store.records_by_newest();
    debug!(target: LOG_TARGET, count = records.len(), "Rendering listing");

    Maud(html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { "souparchive" }
            }
            body {
                h1 { "souparchive" }
                @if records.is_empty() {
                    p { "The archive is empty." }
                } @else {
                    ul {
                        @for record in &records {
                            (render_record(record))
                        }
                    }
                }
            }
        }
    })
}

fn render_record(record: &ArchiveRecord) -> Markup {
    let filename = record.filename.as_deref().unwrap_or_default();
    html! {
        li {
            a href=(file_href(filename)) { (filename) }
        }
    }
}

async fn get_list(State(state): State<SharedState>) -> impl IntoResponse {
    let store = state.load_archive().await;
    let body: String = store
        .records_by_newest()
        .into_iter()
        .filter_map(|r| r.filename.as_deref())
        .map(|name| format!("{name}\n"))
        .collect();

    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )],
        body,
    )
}
