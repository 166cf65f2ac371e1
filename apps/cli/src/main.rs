use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use murmur_core_sdk::db::{self, RecordStore, SqliteStore};
use murmur_core_sdk::models::{ChatMessage, ProviderConfig, ProviderKind, Role};
use murmur_core_sdk::prelude::*;

/**
 * \brief CLI 程序入口：启动 HTTP 服务，或直接调用对话与音乐检索。
 */
#[derive(Parser, Debug)]
#[command(name = "murmur", version, about = "Murmur chat and music gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        /** \brief 监听地址，缺省取 MURMUR_ADDR */
        #[arg(long)]
        addr: Option<String>,
    },

    /**
     * \brief 保存 Provider 配置。
     * \param provider   协议类型，如 openai/claude/gemini/custom
     * \param credential API Key
     * \param model      模型名
     * \param base       API 基地址，custom 必填
     */
    Init {
        #[arg(long, default_value = "default")]
        name: String,
        #[arg(long, default_value = "openai")]
        provider: String,
        #[arg(long)]
        credential: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        base: Option<String>,
    },

    /**
     * \brief 发送一条消息，打印分段回复与抽取到的标签。
     */
    Chat {
        /** \brief 已保存的 Provider 名称 */
        #[arg(long, default_value = "default")]
        provider: String,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        /** \brief 随消息附带的图片链接 */
        #[arg(long)]
        image: Option<String>,
    },

    /** \brief 列出 Provider 可用模型。 */
    Models {
        #[arg(long, default_value = "default")]
        provider: String,
    },

    #[command(subcommand)]
    Music(MusicCommand),
}

#[derive(Subcommand, Debug)]
enum MusicCommand {
    /** \brief 搜索并校验可播放曲目。 */
    Search {
        keyword: String,
        /** \brief 按歌手搜索 */
        #[arg(long, default_value_t = false)]
        artist: bool,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /** \brief 解析单曲播放地址。 */
    Url { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init();
    let cli = Cli::parse();

    let mut config = GatewayConfig::from_env();

    match cli.command {
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                config.addr = addr;
            }
            server::run(config).await?;
        }
        Commands::Init {
            name,
            provider,
            credential,
            model,
            base,
        } => {
            let kind = ProviderKind::parse(&provider)
                .ok_or_else(|| anyhow!("unknown provider kind: {provider}"))?;
            let profile = ProviderConfig {
                provider_kind: kind,
                base_address: base,
                credential,
                model_id: model,
            };
            if profile.effective_base().is_none() {
                return Err(anyhow!("provider {kind} requires --base"));
            }
            let state = open_state(config)?;
            db::put_json(state.store.as_ref(), &db::provider_key(&name), &profile)
                .await
                .context("save provider failed")?;
            println!(
                "Saved provider {} ({} | {} | {})",
                name,
                kind,
                profile.effective_base().unwrap_or_default(),
                profile.model_id
            );
        }
        Commands::Chat {
            provider,
            prompt,
            system,
            image,
        } => {
            let state = open_state(config)?;
            let profile = load_profile(state.store.as_ref(), &provider).await?;
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::new(Role::System, system));
            }
            let mut user = ChatMessage::new(Role::User, prompt);
            user.image_ref = image;
            messages.push(user);

            let (result, completion) = state
                .chat
                .chat(&profile, &messages)
                .await
                .context("chat failed")?;
            tracing::debug!(endpoint = %completion.url, "chat completed");

            for chunk in &result.message_chunks {
                println!("{chunk}");
                println!();
            }
            let extracted = serde_json::to_string_pretty(&result.extracted)?;
            println!("{extracted}");
        }
        Commands::Models { provider } => {
            let state = open_state(config)?;
            let profile = load_profile(state.store.as_ref(), &provider).await?;
            let models = state
                .chat
                .list_models(&profile)
                .await
                .context("list models failed")?;
            for model in models {
                if model.description.is_empty() {
                    println!("{}", model.id);
                } else {
                    println!("{}\t{}", model.id, model.description);
                }
            }
        }
        Commands::Music(MusicCommand::Search {
            keyword,
            artist,
            limit,
        }) => {
            let state = open_state(config)?;
            let kind = if artist {
                SearchKind::Artist
            } else {
                SearchKind::Track
            };
            let tracks = state
                .music
                .search_playable(&keyword, kind, limit)
                .await
                .context("music search failed")?;
            state
                .tracks
                .remember(&tracks)
                .await
                .context("cache tracks failed")?;
            for track in tracks {
                println!(
                    "{}\t{} - {}",
                    track.id,
                    track.title,
                    track.artist_names.join(" / ")
                );
            }
        }
        Commands::Music(MusicCommand::Url { id }) => {
            let state = open_state(config)?;
            let (track, cached) = state
                .tracks
                .get_or_resolve(&state.music, &id)
                .await
                .context("resolve track url failed")?;
            println!(
                "{}{}",
                track.candidate_url.unwrap_or_default(),
                if cached { " (cached)" } else { "" }
            );
        }
    }

    Ok(())
}

fn open_state(config: GatewayConfig) -> Result<server::AppState> {
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("open record store {} failed", config.db_path))?;
    server::AppState::new(Arc::new(config), Arc::new(store)).context("build client failed")
}

async fn load_profile(store: &dyn RecordStore, name: &str) -> Result<ProviderConfig> {
    db::get_json::<ProviderConfig>(store, &db::provider_key(name))
        .await
        .context("load provider failed")?
        .with_context(|| {
            format!("no provider named {name}, run: murmur init --name {name} --credential ... --model ...")
        })
}
