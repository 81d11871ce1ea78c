use tracing_subscriber::filter::{Directive, EnvFilter, LevelFilter};

/// Install the logging facade, writing to stderr.
///
/// `RUST_LOG` takes precedence when set; otherwise engine logs are emitted
/// at info level and everything else at warn. An embedding driver may have
/// installed its own subscriber already, in which case theirs stays.
pub fn init_logging() {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => {
            let mut fallback = EnvFilter::default().add_directive(LevelFilter::WARN.into());
            if let Ok(engine) = "nullflow=info".parse::<Directive>() {
                fallback = fallback.add_directive(engine);
            }
            fallback
        }
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }
}
