use std::io::Write;

/// 构建统一格式的 logger
///
/// 默认级别为 Info，可以通过 `RUST_LOG` 覆盖（例如 `RUST_LOG=streamline_uploads=debug`）。
fn build_logger() -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            let info_style = buf
                .default_level_style(log::Level::Info)
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green)));
            let warn_style = buf
                .default_level_style(log::Level::Warn)
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow)));
            let error_style = buf
                .default_level_style(log::Level::Error)
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red)));

            let level_style = match record.level() {
                log::Level::Info => info_style,
                log::Level::Warn => warn_style,
                log::Level::Error => error_style,
                _ => buf.default_level_style(record.level()),
            };
            let grey_style = info_style.fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(110, 110, 110))));

            let line = record.line().unwrap_or(!0);
            let file = record.file().unwrap_or("").rsplit(|c| c == '\\' || c == '/').next().unwrap_or("");
            let time = chrono::Local::now().format("%Y/%m/%d %H:%M:%S%.3f");
            let level = record.level();
            let thread = std::thread::current();
            let thread_name = thread.name().unwrap_or("<unnamed>");

            writeln!(
                buf,
                "{level_style}[{time}] {level} ({thread_name}): {}{level_style:#}\n\t {grey_style}At {file}:{line}{grey_style:#}",
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .parse_default_env();
    builder
}

/// 初始化全局 logger，重复调用会 panic
pub fn init_log() {
    build_logger().init();
}

/// 初始化全局 logger，已经初始化过时返回 false
///
/// 测试中每个用例都可能调用，所以不能 panic
pub fn try_init_log() -> bool {
    build_logger().try_init().is_ok()
}
