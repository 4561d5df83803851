//! 实验输出路径.

use std::env;
use std::path::PathBuf;

/// 获取实验输出目录, 不存在时创建.
///
/// 1. 若环境变量 `$TRACT_BERRY_OUT_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/tract-berry-out`.
pub fn output_dir_from_env_or_home() -> PathBuf {
    let dir = match env::var("TRACT_BERRY_OUT_DIR") {
        Ok(d) if !d.is_empty() => PathBuf::from(d),
        _ => dirs::home_dir()
            .expect("无法获取 $HOME")
            .join("tract-berry-out"),
    };
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// 输出目录下以 `name` 为子目录的路径, 不存在时创建.
pub fn output_dir_with(name: &str) -> PathBuf {
    let dir = output_dir_from_env_or_home().join(name);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
