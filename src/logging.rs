use env_logger::Builder;
use log::LevelFilter;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Mutex;

/// Messages already emitted through [`warn_once`]. Lives for the whole process.
static PRINTED_WARNINGS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

pub fn init_logger() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .parse_default_env()
        .init();
}

/// Log `msg` as a warning the first time it is seen. Returns true when it was printed.
pub fn warn_once(msg: impl Into<String>) -> bool {
    let msg = msg.into();
    let mut printed = match PRINTED_WARNINGS.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if printed.contains(&msg) {
        return false;
    }
    log::warn!("{}", msg);
    printed.insert(msg);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warn_once_dedups_by_message() {
        let msg = "warn_once test: some images cannot be fast read";
        assert!(warn_once(msg));
        assert!(!warn_once(msg));
        assert!(!warn_once(msg.to_string()));
        assert!(warn_once("warn_once test: a different message"));
    }
}
