use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header::RETRY_AFTER, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::db::{RecordStore, SqliteStore};
use crate::error::{GatewayError, Unplayable};
use crate::llm::ChatClient;
use crate::models::{
    AvatarChange, ChatInvocationResult, ChatMessage, ModelInfo, ProviderConfig, ProviderKind,
    Track,
};
use crate::music::{MusicResolver, SearchKind};
use crate::track_cache::TrackUrlCache;

const DEFAULT_SEARCH_LIMIT: usize = 10;
const MAX_SEARCH_LIMIT: usize = 50;

/**
 * \brief 各路由共享的只读状态。
 */
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub chat: ChatClient,
    pub music: MusicResolver,
    pub tracks: TrackUrlCache,
    pub store: Arc<dyn RecordStore>,
}

type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: Arc<GatewayConfig>, store: Arc<dyn RecordStore>) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .user_agent(concat!("murmur/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let music = MusicResolver::new(http.clone(), &config.music);
        let tracks = TrackUrlCache::new(store.clone(), *music.policy());
        Ok(Self {
            chat: ChatClient::new(http, &config),
            music,
            tracks,
            store,
            config,
        })
    }
}

/**
 * \brief 组装路由：对话、模型列表、音乐检索与健康检查。
 */
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/models/list", post(list_models))
        .route("/music/search", get(music_search))
        .route("/music/url/{track_id}", get(music_url))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/**
 * \brief 启动 HTTP 服务。
 * \param config 启动时读取的配置，之后只读
 */
pub async fn run(config: GatewayConfig) -> Result<()> {
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("open record store at {}", config.db_path))?;
    let config = Arc::new(config);
    let state = AppState::new(config.clone(), Arc::new(store)).context("build app state")?;

    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("bind {}", config.addr))?;
    tracing::info!(
        target: "murmur.server",
        addr = %config.addr,
        mirrors = config.music.mirrors.len(),
        "listening"
    );
    axum::serve(listener, router(Arc::new(state))).await?;
    Ok(())
}

/**
 * \brief 统一错误响应：`{success:false, error, retryable, ...}`。
 */
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = err.status_code();
        if status.is_server_error() {
            tracing::warn!(target: "murmur.server", %status, "request failed: {err}");
        } else {
            tracing::info!(target: "murmur.server", %status, "request rejected: {err}");
        }

        let mut body = json!({
            "success": false,
            "error": err.user_message(),
            "retryable": err.is_retryable(),
        });
        match &err {
            GatewayError::AllPathsFailed {
                attempted, hint, ..
            } => {
                body["attemptedPaths"] = json!(attempted);
                body["hint"] = json!(hint);
            }
            GatewayError::Unplayable {
                reason: Unplayable::Vip,
                ..
            } => body["isVip"] = json!(true),
            GatewayError::Unplayable {
                reason: Unplayable::Unavailable,
                ..
            } => body["isUnavailable"] = json!(true),
            _ => {}
        }
        let retry_after = err.retry_after();
        if let Some(delay) = retry_after {
            body["retryAfterMs"] = json!(delay.as_millis() as u64);
        }

        let mut resp = (status, Json(body)).into_response();
        if let Some(delay) = retry_after {
            resp.headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(delay.as_secs().max(1)));
        }
        resp
    }
}

fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError(GatewayError::InvalidRequest(rejection.body_text()))
}

fn parse_kind(raw: &str) -> Result<ProviderKind, GatewayError> {
    ProviderKind::parse(raw)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown providerKind: {raw}")))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    /** \brief 协议类型，未知取值返回 400 */
    provider_kind: String,
    #[serde(default)]
    base_address: Option<String>,
    #[serde(default)]
    credential: String,
    #[serde(default)]
    model_id: String,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ModelsRequest {
    provider_kind: String,
    #[serde(default)]
    base_address: Option<String>,
    #[serde(default)]
    credential: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    messages: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_remark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_call: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice_call: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    change_avatar: Option<AvatarChange>,
    /** \brief 实际命中的路径后缀 */
    endpoint: String,
}

impl ChatResponse {
    fn from_result(result: ChatInvocationResult, endpoint: String) -> Self {
        let messages = result.multi_chunk().map(<[String]>::to_vec);
        let fields = result.extracted;
        Self {
            success: true,
            message: result.clean_text,
            messages,
            status: fields.status,
            signature: fields.signature,
            location: fields.location,
            nickname: fields.nickname,
            avatar: fields.avatar,
            user_remark: fields.user_remark,
            memo: fields.memo,
            video_call: fields.video_call_requested.then_some(true),
            voice_call: fields.voice_call_requested.then_some(true),
            change_avatar: fields.avatar_change,
            endpoint,
        }
    }
}

/**
 * \brief 对话接口：POST /chat
 */
async fn chat(
    State(state): State<SharedState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(req) = payload.map_err(bad_body)?;
    let provider = ProviderConfig {
        provider_kind: parse_kind(&req.provider_kind)?,
        base_address: req.base_address,
        credential: req.credential,
        model_id: req.model_id,
    };

    let deadline = state.config.chat_deadline;
    let (result, completion) =
        tokio::time::timeout(deadline, state.chat.chat(&provider, &req.messages))
            .await
            .map_err(|_| GatewayError::Timeout(deadline.as_millis() as u64))??;

    tracing::info!(
        target: "murmur.server",
        provider = %provider.provider_kind,
        endpoint = %completion.path,
        chunks = result.message_chunks.len(),
        "chat completed"
    );
    Ok(Json(ChatResponse::from_result(result, completion.path)))
}

#[derive(Serialize, Debug)]
struct ModelsResponse {
    success: bool,
    models: Vec<ModelInfo>,
}

/**
 * \brief 模型列表：POST /models/list
 */
async fn list_models(
    State(state): State<SharedState>,
    payload: Result<Json<ModelsRequest>, JsonRejection>,
) -> Result<Json<ModelsResponse>, ApiError> {
    let Json(req) = payload.map_err(bad_body)?;
    let provider = ProviderConfig {
        provider_kind: parse_kind(&req.provider_kind)?,
        base_address: req.base_address,
        credential: req.credential,
        model_id: String::new(),
    };
    let deadline = state.config.chat_deadline;
    let models = tokio::time::timeout(deadline, state.chat.list_models(&provider))
        .await
        .map_err(|_| GatewayError::Timeout(deadline.as_millis() as u64))??;
    Ok(Json(ModelsResponse {
        success: true,
        models,
    }))
}

#[derive(Deserialize, Debug, Default)]
struct MusicSearchQuery {
    keyword: Option<String>,
    /** \brief 1 为单曲，100 为歌手 */
    #[serde(rename = "type")]
    kind: Option<u32>,
    limit: Option<usize>,
}

/**
 * \brief 音乐检索：GET /music/search?keyword=&type=&limit=
 */
async fn music_search(
    State(state): State<SharedState>,
    Query(q): Query<MusicSearchQuery>,
) -> Result<Json<Value>, ApiError> {
    let keyword = q
        .keyword
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("keyword is required".into()))?;
    let code = q.kind.unwrap_or(1);
    let kind = SearchKind::from_code(code)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("unsupported search type {code}")))?;
    let limit = q
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);

    let tracks = state.music.search_playable(&keyword, kind, limit).await?;
    if let Err(e) = state.tracks.remember(&tracks).await {
        tracing::warn!(target: "murmur.server", "failed to cache verified tracks: {e}");
    }
    Ok(Json(json!({ "success": true, "data": { "songs": tracks } })))
}

fn track_payload(track: &Track) -> Value {
    json!({
        "id": track.id,
        "url": track.candidate_url,
        "fee": track.fee_code,
        "feeTier": track.fee_tier,
        "title": track.title,
        "artists": track.artist_names,
        "urlExpiresAt": track.url_expires_at.and_then(|t| t.format(&Rfc3339).ok()),
    })
}

/**
 * \brief 单曲播放地址：GET /music/url/{track_id}
 */
async fn music_url(
    State(state): State<SharedState>,
    Path(track_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let (track, cached) = state.tracks.get_or_resolve(&state.music, &track_id).await?;
    Ok(Json(json!({
        "success": true,
        "cached": cached,
        "data": track_payload(&track),
    })))
}

/**
 * \brief 健康检查：返回运行环境就绪情况。
 */
async fn health(State(state): State<SharedState>) -> Json<Value> {
    let store_ready = matches!(
        tokio::time::timeout(state.config.health_timeout, state.store.get("health:ping")).await,
        Ok(Ok(_))
    );
    Json(json!({
        "success": true,
        "version": env!("CARGO_PKG_VERSION"),
        "mirrorsConfigured": state.music.mirrors().len(),
        "storeReady": store_ready,
        "freeFeeTiers": state.config.music.free_fee_codes,
        "probeBatch": state.config.music.probe_batch,
        "probeBudget": state.config.music.probe_budget,
    }))
}
