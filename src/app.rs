use axum::{
    Json, Router,
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::EditorConfig;
use crate::editor::{Editor, Upload};
use crate::error::EditorError;
use crate::session::TableKind;

pub struct AppState {
    editor: Editor,
}

/// Error body returned by every failing endpoint.
#[derive(Serialize)]
struct ErrorResponse {
    status: String,
    message: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<EditorError> for ApiError {
    fn from(err: EditorError) -> Self {
        let status = match &err {
            EditorError::NotFound(_) => StatusCode::NOT_FOUND,
            EditorError::InvalidState(_) => StatusCode::BAD_REQUEST,
            EditorError::ParseFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("worker task failed: {err}"),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: format!("invalid upload: {err}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            status: "error".to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run a synchronous editor call on the blocking pool.
async fn blocking<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    F: FnOnce(&Editor) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let editor = state.editor.clone();
    Ok(tokio::task::spawn_blocking(move || f(&editor)).await??)
}

#[derive(Deserialize)]
struct TableQuery {
    table: Option<TableKind>,
}

#[derive(Deserialize)]
struct SessionRequest {
    session_id: String,
    table: Option<TableKind>,
}

#[derive(Deserialize)]
struct EditItemRequest {
    session_id: String,
    item_id: String,
    new_value: String,
    table: Option<TableKind>,
}

#[derive(Deserialize)]
struct AppendItemRequest {
    session_id: String,
    item_id: String,
    separator: Option<String>,
    value: Option<String>,
    table: Option<TableKind>,
}

#[derive(Deserialize)]
struct RemoveItemRequest {
    session_id: String,
    item_id: String,
    table: Option<TableKind>,
}

#[derive(Deserialize)]
struct ClearCellRequest {
    session_id: String,
    row_id: String,
    field: String,
    table: Option<TableKind>,
}

#[derive(Deserialize)]
struct RowRequest {
    session_id: String,
    row_id: String,
    table: Option<TableKind>,
}

#[derive(Deserialize)]
struct RevalidateRequest {
    session_id: String,
    verify_id_existence: Option<bool>,
}

#[derive(Deserialize)]
struct FilteredRowsRequest {
    session_id: String,
    issue_id: String,
    table: Option<TableKind>,
}

#[derive(Serialize)]
struct FilteredRowsResponse {
    rows: Vec<u64>,
    html: String,
}

#[derive(Deserialize)]
struct SaveDraftRequest {
    session_id: String,
    name: Option<String>,
}

pub async fn run(config: EditorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let editor = Editor::from_config(config.clone())?;

    spawn_cleanup(editor.clone(), config.cleanup_interval());

    let app_state = Arc::new(AppState { editor });

    let app = Router::new()
        .route("/", get(serve_landing))
        .route("/health", get(health))
        .route("/editor/:session_id", get(serve_editor))
        .route("/api/upload/", post(upload))
        .route("/api/upload/session/:session_id", get(session_info))
        .route("/api/upload/:session_id", delete(delete_session))
        .route("/api/edit/html/:session_id", get(current_html))
        .route("/api/edit/raw/:session_id", get(raw_html))
        .route("/api/edit/overlays/:session_id", get(overlay_html))
        .route("/api/edit/diff/:session_id", get(deletion_diff))
        .route("/api/edit/edited/:session_id", get(edited_items))
        .route("/api/edit/history/:session_id", get(history))
        .route("/api/edit/item", post(edit_item))
        .route("/api/edit/append", post(append_item))
        .route("/api/edit/remove-item", post(remove_item))
        .route("/api/edit/clear-cell", post(clear_cell))
        .route("/api/edit/delete-row", post(delete_row))
        .route("/api/edit/add-row", post(add_row))
        .route("/api/edit/undo", post(undo))
        .route("/api/edit/redo", post(redo))
        .route("/api/edit/revalidate", post(revalidate))
        .route("/api/edit/filtered-rows", post(filtered_rows))
        .route("/api/export/:session_id", get(export_csv))
        .route("/api/export/archive/:session_id", get(export_archive))
        .route("/api/draft/save", post(save_draft))
        .route("/api/draft/list", get(list_drafts))
        .route("/api/draft/load", post(load_draft))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let listener = TcpListener::bind(&config.bind_address).await?;
    info!("Listening on http://{}", config.bind_address);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Purge expired sessions on a fixed interval.
fn spawn_cleanup(editor: Editor, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let editor = editor.clone();
            match tokio::task::spawn_blocking(move || editor.purge_expired()).await {
                Ok(Ok(purged)) if !purged.is_empty() => info!(count = purged.len(), "expired sessions removed"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "session cleanup failed"),
                Err(e) => warn!(error = %e, "session cleanup task panicked"),
            }
        }
    });
}

async fn serve_landing() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn serve_editor(
    Path(session_id): Path<String>,
    Query(query): Query<TableQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Html<String>> {
    let html = blocking(&state, move |editor| editor.current_document(&session_id, query.table)).await?;
    Ok(Html(html))
}

async fn upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> ApiResult<Response> {
    let mut uploads = Vec::new();
    let mut verify = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "metadata_file" | "citations_file" => {
                let table = if name == "metadata_file" { TableKind::Meta } else { TableKind::Cits };
                let file_name = field.file_name().map(str::to_string);
                let contents = field.bytes().await?.to_vec();
                // browsers send an empty part for an unselected file input
                if contents.is_empty() && file_name.as_deref().is_none_or(str::is_empty) {
                    continue;
                }
                uploads.push(Upload {
                    table,
                    file_name,
                    contents,
                });
            }
            "verify_id_existence" => {
                let text = field.text().await?;
                verify = Some(matches!(text.trim(), "true" | "1" | "on" | "yes"));
            }
            _ => {}
        }
    }

    let created = blocking(&state, move |editor| editor.create_session(uploads, verify)).await?;
    Ok(Json(created).into_response())
}

async fn session_info(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    let info = blocking(&state, move |editor| editor.session_info(&session_id)).await?;
    Ok(Json(info).into_response())
}

async fn delete_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    let deleted = blocking(&state, move |editor| editor.delete_session(&session_id)).await?;
    if !deleted {
        return Err(EditorError::not_found("session").into());
    }
    Ok(Json(serde_json::json!({ "status": "ok" })).into_response())
}

async fn current_html(
    Path(session_id): Path<String>,
    Query(query): Query<TableQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Html<String>> {
    let html = blocking(&state, move |editor| editor.current_document(&session_id, query.table)).await?;
    Ok(Html(html))
}

async fn raw_html(
    Path(session_id): Path<String>,
    Query(query): Query<TableQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Html<String>> {
    let html = blocking(&state, move |editor| editor.raw_document(&session_id, query.table)).await?;
    Ok(Html(html))
}

async fn overlay_html(
    Path(session_id): Path<String>,
    Query(query): Query<TableQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Html<String>> {
    let html = blocking(&state, move |editor| editor.document_with_overlays(&session_id, query.table)).await?;
    Ok(Html(html))
}

async fn deletion_diff(
    Path(session_id): Path<String>,
    Query(query): Query<TableQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    let diff = blocking(&state, move |editor| editor.deletion_diff(&session_id, query.table)).await?;
    Ok(Json(diff).into_response())
}

async fn edited_items(
    Path(session_id): Path<String>,
    Query(query): Query<TableQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    let items = blocking(&state, move |editor| editor.edited_items(&session_id, query.table)).await?;
    Ok(Json(items).into_response())
}

async fn history(
    Path(session_id): Path<String>,
    Query(query): Query<TableQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    let availability = blocking(&state, move |editor| editor.history_availability(&session_id, query.table)).await?;
    Ok(Json(availability).into_response())
}

async fn edit_item(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EditItemRequest>,
) -> ApiResult<Response> {
    let edited = blocking(&state, move |editor| {
        editor.set_item_value(&payload.session_id, payload.table, &payload.item_id, &payload.new_value)
    })
    .await?;
    Ok(Json(edited).into_response())
}

async fn append_item(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AppendItemRequest>,
) -> ApiResult<Response> {
    let edited = blocking(&state, move |editor| {
        editor.append_item(
            &payload.session_id,
            payload.table,
            &payload.item_id,
            payload.separator.as_deref(),
            payload.value.as_deref(),
        )
    })
    .await?;
    Ok(Json(edited).into_response())
}

async fn remove_item(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RemoveItemRequest>,
) -> ApiResult<Response> {
    let edited = blocking(&state, move |editor| {
        editor.remove_item(&payload.session_id, payload.table, &payload.item_id)
    })
    .await?;
    Ok(Json(edited).into_response())
}

async fn clear_cell(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ClearCellRequest>,
) -> ApiResult<Response> {
    let edited = blocking(&state, move |editor| {
        editor.clear_cell(&payload.session_id, payload.table, &payload.row_id, &payload.field)
    })
    .await?;
    Ok(Json(edited).into_response())
}

async fn delete_row(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RowRequest>,
) -> ApiResult<Response> {
    let edited = blocking(&state, move |editor| {
        editor.delete_row(&payload.session_id, payload.table, &payload.row_id)
    })
    .await?;
    Ok(Json(edited).into_response())
}

async fn add_row(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SessionRequest>,
) -> ApiResult<Response> {
    let edited = blocking(&state, move |editor| editor.add_row(&payload.session_id, payload.table)).await?;
    Ok(Json(edited).into_response())
}

async fn undo(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SessionRequest>,
) -> ApiResult<Response> {
    let step = blocking(&state, move |editor| editor.undo(&payload.session_id, payload.table)).await?;
    Ok(Json(step).into_response())
}

async fn redo(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SessionRequest>,
) -> ApiResult<Response> {
    let step = blocking(&state, move |editor| editor.redo(&payload.session_id, payload.table)).await?;
    Ok(Json(step).into_response())
}

async fn revalidate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RevalidateRequest>,
) -> ApiResult<Response> {
    let summary = blocking(&state, move |editor| {
        editor.revalidate(&payload.session_id, payload.verify_id_existence)
    })
    .await?;
    Ok(Json(summary).into_response())
}

async fn filtered_rows(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<FilteredRowsRequest>,
) -> ApiResult<Response> {
    let response = blocking(&state, move |editor| {
        let rows = editor.rows_by_issue(&payload.session_id, payload.table, &payload.issue_id)?;
        let html = editor.filtered_rows(&payload.session_id, payload.table, &payload.issue_id)?;
        Ok(FilteredRowsResponse { rows, html })
    })
    .await?;
    Ok(Json(response).into_response())
}

async fn export_csv(
    Path(session_id): Path<String>,
    Query(query): Query<TableQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    let export = blocking(&state, move |editor| editor.export_csv(&session_id, query.table)).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", export.file_name),
            ),
        ],
        export.content,
    )
        .into_response())
}

async fn export_archive(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    let file_name = format!("{session_id}.session.gz");
    let bytes = blocking(&state, move |editor| editor.export_archive(&session_id)).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        Bytes::from(bytes),
    )
        .into_response())
}

async fn save_draft(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SaveDraftRequest>,
) -> ApiResult<Response> {
    let info = blocking(&state, move |editor| editor.save_draft(&payload.session_id, payload.name)).await?;
    Ok(Json(info).into_response())
}

async fn list_drafts(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let drafts = blocking(&state, |editor| editor.list_drafts()).await?;
    Ok(Json(drafts).into_response())
}

async fn load_draft(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> ApiResult<Response> {
    let mut archive = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("archive") {
            archive = field.bytes().await?.to_vec();
        }
    }
    if archive.is_empty() {
        return Err(EditorError::invalid("no archive data received").into());
    }

    let info = blocking(&state, move |editor| editor.import_archive(&archive)).await?;
    Ok(Json(info).into_response())
}

const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>OpenCitations table editor</title></head>
<body>
<h1>OpenCitations table editor</h1>
<form id="upload" method="post" action="/api/upload/" enctype="multipart/form-data">
  <label>Metadata CSV <input type="file" name="metadata_file" accept=".csv"></label>
  <label>Citations CSV <input type="file" name="citations_file" accept=".csv"></label>
  <label><input type="checkbox" name="verify_id_existence" value="true"> Verify identifier existence</label>
  <button type="submit">Validate</button>
</form>
<script>
document.getElementById("upload").addEventListener("submit", async (event) => {
  event.preventDefault();
  const response = await fetch("/api/upload/", { method: "POST", body: new FormData(event.target) });
  const body = await response.json();
  if (response.ok) {
    window.location = "/editor/" + body.session_id;
  } else {
    alert(body.message);
  }
});
</script>
</body>
</html>
"#;
