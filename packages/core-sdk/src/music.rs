use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use time::OffsetDateTime;

use crate::config::MusicConfig;
use crate::error::{GatewayError, Unplayable};
use crate::models::{FeeTier, Track};
use crate::track_cache::UrlCachePolicy;
use crate::verify::{self, TrackProber, VerifyOptions};

/// Fee code the mirrors use for VIP-only tracks.
pub const VIP_FEE_CODE: i64 = 1;

/// Fee codes treated as free. `8` is read as "free at reduced quality"; the
/// mirrors do not document it, so it stays configurable.
pub const DEFAULT_FREE_FEE_CODES: [i64; 2] = [0, 8];

/// Validity assumed when a mirror omits `expi`.
const DEFAULT_URL_VALIDITY: Duration = Duration::from_secs(1200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Track,
    Artist,
}

impl SearchKind {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(SearchKind::Track),
            100 => Some(SearchKind::Artist),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            SearchKind::Track => 1,
            SearchKind::Artist => 100,
        }
    }
}

/**
 * \brief 收费等级划分，免费 fee 值由配置决定。
 */
#[derive(Debug, Clone)]
pub struct FeeTaxonomy {
    free_codes: Vec<i64>,
}

impl FeeTaxonomy {
    pub fn new(free_codes: Vec<i64>) -> Self {
        Self { free_codes }
    }

    pub fn classify(&self, fee: i64) -> FeeTier {
        if self.free_codes.contains(&fee) {
            FeeTier::Free
        } else if fee == VIP_FEE_CODE {
            FeeTier::Vip
        } else {
            FeeTier::Partial
        }
    }
}

impl Default for FeeTaxonomy {
    fn default() -> Self {
        Self::new(DEFAULT_FREE_FEE_CODES.to_vec())
    }
}

/**
 * \brief 单曲播放地址解析结果。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedUrl {
    pub url: String,
    pub fee_code: i64,
    pub expires_at: OffsetDateTime,
    pub bitrate: Option<u64>,
    pub size: Option<u64>,
}

/**
 * \brief 搜索结果：命中的镜像与过滤后的候选曲目。
 */
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub mirror: String,
    pub tracks: Vec<Track>,
}

/**
 * \brief 多镜像音乐检索：按顺序故障转移，首个返回有效数据的镜像独占本次调用。
 */
#[derive(Debug, Clone)]
pub struct MusicResolver {
    http: Client,
    mirrors: Vec<String>,
    search_timeout: Duration,
    probe_timeout: Duration,
    probe_batch: usize,
    probe_budget: usize,
    taxonomy: FeeTaxonomy,
    policy: UrlCachePolicy,
}

impl MusicResolver {
    pub fn new(http: Client, config: &MusicConfig) -> Self {
        Self {
            http,
            mirrors: config.mirrors.clone(),
            search_timeout: config.search_timeout,
            probe_timeout: config.probe_timeout,
            probe_batch: config.probe_batch,
            probe_budget: config.probe_budget,
            taxonomy: FeeTaxonomy::new(config.free_fee_codes.clone()),
            policy: UrlCachePolicy::from_config(config),
        }
    }

    pub fn mirrors(&self) -> &[String] {
        &self.mirrors
    }

    pub fn policy(&self) -> &UrlCachePolicy {
        &self.policy
    }

    pub fn taxonomy(&self) -> &FeeTaxonomy {
        &self.taxonomy
    }

    /**
     * \brief 关键词搜索（含本地 VIP/试听过滤），不做可播放性校验。
     */
    pub async fn search(
        &self,
        keyword: &str,
        kind: SearchKind,
        limit: usize,
    ) -> Result<SearchHit, GatewayError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(GatewayError::InvalidRequest("keyword is required".into()));
        }
        let limit = limit.max(1);

        for mirror in &self.mirrors {
            let payload = match self
                .fetch(
                    mirror,
                    "/search",
                    &[
                        ("keywords", keyword.to_string()),
                        ("type", kind.code().to_string()),
                        ("limit", limit.to_string()),
                    ],
                    self.search_timeout,
                )
                .await
            {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::info!(target: "murmur.music", %mirror, "mirror search failed: {e}");
                    continue;
                }
            };

            let raw = match kind {
                SearchKind::Track => songs_of(&payload["result"]),
                SearchKind::Artist => match self.artist_catalog(mirror, keyword, &payload).await {
                    Ok(songs) => songs,
                    Err(e) => {
                        // the whole two-step search moves to the next mirror
                        tracing::info!(target: "murmur.music", %mirror, "artist catalog failed: {e}");
                        continue;
                    }
                },
            };
            let tracks = prefilter(
                raw.iter()
                    .filter_map(|song| parse_track(song, &self.taxonomy))
                    .collect(),
            );
            tracing::info!(
                target: "murmur.music",
                %mirror,
                found = raw.len(),
                kept = tracks.len(),
                "search resolved"
            );
            return Ok(SearchHit {
                mirror: mirror.clone(),
                tracks,
            });
        }

        Err(GatewayError::NoResolverAvailable {
            tried: self.mirrors.len(),
        })
    }

    /**
     * \brief 搜索并校验可播放性，返回至多 `limit` 首确认可播放的曲目。
     */
    pub async fn search_playable(
        &self,
        keyword: &str,
        kind: SearchKind,
        limit: usize,
    ) -> Result<Vec<Track>, GatewayError> {
        let limit = limit.max(1);
        let fetch = limit.saturating_mul(3).min(self.probe_budget.max(limit));
        let hit = self.search(keyword, kind, fetch).await?;
        let prober = MirrorProber {
            resolver: self,
            mirror: &hit.mirror,
        };
        let options = VerifyOptions {
            target_count: limit,
            batch_size: self.probe_batch,
            per_probe_timeout: self.probe_timeout,
            max_scan: self.probe_budget,
        };
        Ok(verify::verify(hit.tracks, &options, &prober).await)
    }

    /**
     * \brief 单曲播放地址解析，镜像间故障转移；任一镜像给出有效答复即为定论。
     */
    pub async fn resolve_url(&self, track_id: &str) -> Result<ResolvedUrl, GatewayError> {
        let track_id = track_id.trim();
        if track_id.is_empty() {
            return Err(GatewayError::InvalidRequest("track id is required".into()));
        }
        for mirror in &self.mirrors {
            match self.resolve_on(mirror, track_id, self.search_timeout).await {
                Err(GatewayError::Unplayable { track_id, reason }) => {
                    return Err(GatewayError::Unplayable { track_id, reason })
                }
                Err(e) => {
                    tracing::info!(target: "murmur.music", %mirror, track_id, "url lookup failed: {e}");
                }
                Ok(resolved) => return Ok(resolved),
            }
        }
        Err(GatewayError::NoResolverAvailable {
            tried: self.mirrors.len(),
        })
    }

    async fn resolve_on(
        &self,
        mirror: &str,
        track_id: &str,
        timeout: Duration,
    ) -> Result<ResolvedUrl, GatewayError> {
        let payload = self
            .fetch(mirror, "/song/url", &[("id", track_id.to_string())], timeout)
            .await?;
        let entry = payload["data"]
            .as_array()
            .and_then(|items| items.first())
            .ok_or_else(|| GatewayError::MalformedResponse("song/url without data".into()))?;
        classify_url_entry(entry, track_id, &self.taxonomy, &self.policy)
    }

    async fn artist_catalog(
        &self,
        mirror: &str,
        keyword: &str,
        payload: &Value,
    ) -> Result<Vec<Value>, GatewayError> {
        let artists = payload["result"]["artists"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let Some(artist) = best_artist(&artists, keyword) else {
            tracing::info!(target: "murmur.music", %mirror, keyword, "no artist matched");
            return Ok(Vec::new());
        };
        let artist_id = id_of(&artist["id"]).ok_or_else(|| {
            GatewayError::MalformedResponse("artist record without id".into())
        })?;

        let catalog = self
            .fetch(
                mirror,
                "/artist/top/song",
                &[("id", artist_id)],
                self.search_timeout,
            )
            .await?;
        Ok(songs_of(&catalog))
    }

    /// GET a mirror endpoint; only a 2xx JSON body with `code == 200` counts.
    async fn fetch(
        &self,
        mirror: &str,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}{}", mirror.trim_end_matches('/'), path);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .timeout(timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::Upstream {
                status: Some(status.as_u16()),
                message: format!("mirror returned {status}"),
            });
        }
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(format!("mirror payload: {e}")))?;
        match payload.get("code").and_then(Value::as_i64) {
            Some(200) => Ok(payload),
            code => Err(GatewayError::Upstream {
                status: None,
                message: format!("mirror payload code {code:?}"),
            }),
        }
    }
}

/**
 * \brief 在搜索命中的镜像上逐曲探测。
 */
struct MirrorProber<'a> {
    resolver: &'a MusicResolver,
    mirror: &'a str,
}

#[async_trait]
impl TrackProber for MirrorProber<'_> {
    async fn probe(&self, track: &Track) -> Result<ResolvedUrl, GatewayError> {
        self.resolver
            .resolve_on(self.mirror, &track.id, self.resolver.probe_timeout)
            .await
    }
}

/**
 * \brief 本地预过滤：VIP 专属与仅试听曲目不进入探测。
 */
pub fn prefilter(tracks: Vec<Track>) -> Vec<Track> {
    tracks
        .into_iter()
        .filter(|t| t.fee_tier != FeeTier::Vip && !t.has_trial_only)
        .collect()
}

fn classify_url_entry(
    entry: &Value,
    track_id: &str,
    taxonomy: &FeeTaxonomy,
    policy: &UrlCachePolicy,
) -> Result<ResolvedUrl, GatewayError> {
    let fee_code = entry["fee"].as_i64().unwrap_or(0);
    let trial_only = !entry["freeTrialInfo"].is_null();
    let url = entry["url"].as_str().map(str::trim).unwrap_or_default();

    // fee can change after search; a VIP verdict here overrides any url
    if trial_only || taxonomy.classify(fee_code) == FeeTier::Vip {
        return Err(GatewayError::Unplayable {
            track_id: track_id.to_string(),
            reason: Unplayable::Vip,
        });
    }
    if url.is_empty() {
        return Err(GatewayError::Unplayable {
            track_id: track_id.to_string(),
            reason: Unplayable::Unavailable,
        });
    }

    let validity = entry["expi"]
        .as_u64()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_URL_VALIDITY);
    Ok(ResolvedUrl {
        url: url.to_string(),
        fee_code,
        expires_at: policy.stamp(OffsetDateTime::now_utc(), validity),
        bitrate: entry["br"].as_u64(),
        size: entry["size"].as_u64(),
    })
}

fn songs_of(container: &Value) -> Vec<Value> {
    container["songs"].as_array().cloned().unwrap_or_default()
}

fn best_artist(artists: &[Value], keyword: &str) -> Option<Value> {
    artists
        .iter()
        .find(|a| {
            a["name"]
                .as_str()
                .is_some_and(|name| name.trim().eq_ignore_ascii_case(keyword))
        })
        .or_else(|| artists.first())
        .cloned()
}

fn id_of(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/**
 * \brief 解析镜像返回的歌曲记录，兼容 `artists` 与 `ar` 两种字段名。
 */
pub fn parse_track(song: &Value, taxonomy: &FeeTaxonomy) -> Option<Track> {
    let id = id_of(&song["id"])?;
    let title = song["name"].as_str().unwrap_or_default().to_string();
    let artist_names = song
        .get("artists")
        .or_else(|| song.get("ar"))
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|a| a["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let fee_code = song["fee"].as_i64().unwrap_or(0);
    Some(Track {
        id,
        title,
        artist_names,
        fee_tier: taxonomy.classify(fee_code),
        fee_code,
        has_trial_only: !song["freeTrialInfo"].is_null(),
        candidate_url: None,
        url_expires_at: None,
    })
}
