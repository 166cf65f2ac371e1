use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::config::MusicConfig;
use crate::db::{self, RecordStore};
use crate::error::GatewayError;
use crate::models::Track;
use crate::music::{MusicResolver, ResolvedUrl};

/**
 * \brief 播放地址有效期策略。
 * \details 写入时以上游声明的有效期减去安全余量作为过期时间；
 *          使用前若距过期不足刷新窗口，则重新解析。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlCachePolicy {
    pub safety_buffer: Duration,
    pub refresh_window: Duration,
}

impl Default for UrlCachePolicy {
    fn default() -> Self {
        Self::from_config(&MusicConfig::default())
    }
}

impl UrlCachePolicy {
    pub fn from_config(config: &MusicConfig) -> Self {
        Self {
            safety_buffer: config.url_safety_buffer,
            refresh_window: config.url_refresh_window,
        }
    }

    /** \brief 计算过期时间；有效期短于安全余量时立即过期。 */
    pub fn stamp(&self, now: OffsetDateTime, validity: Duration) -> OffsetDateTime {
        now + validity.saturating_sub(self.safety_buffer)
    }

    pub fn needs_refresh(&self, track: &Track, now: OffsetDateTime) -> bool {
        match (&track.candidate_url, track.url_expires_at) {
            (Some(url), Some(expires_at)) if !url.is_empty() => {
                now >= expires_at - self.refresh_window
            }
            _ => true,
        }
    }
}

/**
 * \brief `track:<id>` 记录之上的读穿缓存。
 */
#[derive(Clone)]
pub struct TrackUrlCache {
    store: Arc<dyn RecordStore>,
    policy: UrlCachePolicy,
}

impl TrackUrlCache {
    pub fn new(store: Arc<dyn RecordStore>, policy: UrlCachePolicy) -> Self {
        Self { store, policy }
    }

    /**
     * \brief 记住已校验的曲目，供之后按 id 取地址。
     */
    pub async fn remember(&self, tracks: &[Track]) -> Result<(), GatewayError> {
        for track in tracks.iter().filter(|t| t.candidate_url.is_some()) {
            db::put_json(self.store.as_ref(), &db::track_key(&track.id), track).await?;
        }
        Ok(())
    }

    /**
     * \brief 取曲目播放地址：缓存未到刷新点直接返回，否则经镜像重新解析并回写。
     * \return (曲目, 是否命中缓存)
     */
    pub async fn get_or_resolve(
        &self,
        resolver: &MusicResolver,
        track_id: &str,
    ) -> Result<(Track, bool), GatewayError> {
        let key = db::track_key(track_id);
        let stored: Option<Track> = db::get_json(self.store.as_ref(), &key).await?;
        if let Some(track) = &stored {
            if !self.policy.needs_refresh(track, OffsetDateTime::now_utc()) {
                return Ok((track.clone(), true));
            }
            tracing::debug!(target: "murmur.music", track_id, "cached url due for refresh");
        }

        let resolved = match resolver.resolve_url(track_id).await {
            Ok(resolved) => resolved,
            Err(e @ GatewayError::Unplayable { .. }) => {
                if stored.is_some() {
                    self.store.delete(&key).await?;
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let track = refresh_track(stored, track_id, resolved, resolver);
        db::put_json(self.store.as_ref(), &key, &track).await?;
        Ok((track, false))
    }
}

fn refresh_track(
    stored: Option<Track>,
    track_id: &str,
    resolved: ResolvedUrl,
    resolver: &MusicResolver,
) -> Track {
    let fee_tier = resolver.taxonomy().classify(resolved.fee_code);
    let mut track = stored.unwrap_or_else(|| Track {
        id: track_id.to_string(),
        title: String::new(),
        artist_names: Vec::new(),
        fee_tier,
        fee_code: resolved.fee_code,
        has_trial_only: false,
        candidate_url: None,
        url_expires_at: None,
    });
    track.fee_tier = fee_tier;
    track.fee_code = resolved.fee_code;
    track.candidate_url = Some(resolved.url);
    track.url_expires_at = Some(resolved.expires_at);
    track
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::FeeTier;
    use mockito::{Matcher, Server};
    use reqwest::Client;

    fn track(url: Option<&str>, expires_at: Option<OffsetDateTime>) -> Track {
        Track {
            id: "7".into(),
            title: "Seven".into(),
            artist_names: vec!["S".into()],
            fee_tier: FeeTier::Free,
            fee_code: 0,
            has_trial_only: false,
            candidate_url: url.map(str::to_string),
            url_expires_at: expires_at,
        }
    }

    fn cache() -> (TrackUrlCache, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        (
            TrackUrlCache::new(store.clone(), UrlCachePolicy::default()),
            store,
        )
    }

    fn resolver(mirrors: Vec<String>) -> MusicResolver {
        MusicResolver::new(
            Client::new(),
            &MusicConfig {
                mirrors,
                ..MusicConfig::default()
            },
        )
    }

    #[test]
    fn stamp_subtracts_safety_buffer() {
        let policy = UrlCachePolicy::default();
        let now = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(
            policy.stamp(now, Duration::from_secs(1200)),
            now + Duration::from_secs(1080)
        );
        assert_eq!(policy.stamp(now, Duration::from_secs(30)), now);
    }

    #[test]
    fn refresh_threshold() {
        let policy = UrlCachePolicy::default();
        let now = OffsetDateTime::UNIX_EPOCH + Duration::from_secs(10_000);
        let fresh = track(Some("u"), Some(now + Duration::from_secs(61)));
        let due = track(Some("u"), Some(now + Duration::from_secs(60)));
        assert!(!policy.needs_refresh(&fresh, now));
        assert!(policy.needs_refresh(&due, now));
        assert!(policy.needs_refresh(&track(None, None), now));
        assert!(policy.needs_refresh(&track(Some("u"), None), now));
    }

    #[tokio::test]
    async fn fresh_record_is_served_without_mirrors() {
        let (cache, _store) = cache();
        let far = OffsetDateTime::now_utc() + Duration::from_secs(3600);
        cache
            .remember(&[track(Some("https://cdn/7.mp3"), Some(far))])
            .await
            .unwrap();

        let (hit, cached) = cache.get_or_resolve(&resolver(vec![]), "7").await.unwrap();
        assert!(cached);
        assert_eq!(hit.title, "Seven");
    }

    #[tokio::test]
    async fn stale_record_is_re_resolved_and_written_back() {
        let mut server = Server::new_async().await;
        let lookup = server
            .mock("GET", "/song/url")
            .match_query(Matcher::UrlEncoded("id".into(), "7".into()))
            .with_status(200)
            .with_body(r#"{"code": 200, "data": [{"id": 7, "url": "https://cdn/new.mp3", "fee": 8, "expi": 1200}]}"#)
            .expect(1)
            .create_async()
            .await;

        let (cache, store) = cache();
        let stale = OffsetDateTime::now_utc() + Duration::from_secs(10);
        cache
            .remember(&[track(Some("https://cdn/old.mp3"), Some(stale))])
            .await
            .unwrap();

        let (fresh, cached) = cache
            .get_or_resolve(&resolver(vec![server.url()]), "7")
            .await
            .unwrap();
        assert!(!cached);
        assert_eq!(fresh.title, "Seven");
        assert_eq!(fresh.candidate_url.as_deref(), Some("https://cdn/new.mp3"));
        assert_eq!(fresh.fee_code, 8);

        let saved: Option<Track> = db::get_json(store.as_ref(), "track:7").await.unwrap();
        assert_eq!(saved, Some(fresh));
        lookup.assert_async().await;
    }

    #[tokio::test]
    async fn unplayable_drops_the_stale_record() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/song/url")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"code": 200, "data": [{"id": 7, "url": null, "fee": 0}]}"#)
            .create_async()
            .await;

        let (cache, store) = cache();
        cache
            .remember(&[track(Some("https://cdn/old.mp3"), Some(OffsetDateTime::UNIX_EPOCH))])
            .await
            .unwrap();

        let err = cache
            .get_or_resolve(&resolver(vec![server.url()]), "7")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
        assert_eq!(store.get("track:7").await.unwrap(), None);
    }
}
