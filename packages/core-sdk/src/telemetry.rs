use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

/**
 * \brief 初始化日志订阅器，输出到 stderr。
 * \details 过滤规则依次取 `MURMUR_LOG`、`RUST_LOG`，均未设置时为 `info`。
 *          重复调用不会报错，后续调用保持首次的配置。
 */
pub fn init() {
    let filter = filter_from(
        std::env::var("MURMUR_LOG")
            .ok()
            .or_else(|| std::env::var("RUST_LOG").ok()),
    );
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .try_init();
}

fn filter_from(directive: Option<String>) -> EnvFilter {
    directive
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| match EnvFilter::try_new(&d) {
            Ok(filter) => Some(filter),
            Err(e) => {
                eprintln!("invalid log filter {d:?}: {e}");
                None
            }
        })
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_info() {
        assert_eq!(filter_from(None).to_string(), "info");
        assert_eq!(filter_from(Some("  ".into())).to_string(), "info");
        assert_eq!(filter_from(Some("murmur=verbose".into())).to_string(), "info");
    }

    #[test]
    fn honours_explicit_directive() {
        let filter = filter_from(Some("murmur.retry=debug".into()));
        assert!(filter.to_string().contains("murmur.retry=debug"));
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
