// 离线用户管理工具：创建或重置用户口令后整体落盘。
// 核心服务不提供注册接口，用户记录只经由这里变更。
use akgate_server::config::load_config;
use akgate_server::user_store;
use anyhow::{anyhow, Result};
use std::path::Path;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let (username, password, path_override) = match args.as_slice() {
        [_, username, password] => (username.clone(), password.clone(), None),
        [_, username, password, path] => {
            (username.clone(), password.clone(), Some(path.clone()))
        }
        _ => {
            eprintln!("用法: create-user <用户名> <密码> [用户文件路径]");
            return Err(anyhow!("参数数量不正确"));
        }
    };
    let path = path_override.unwrap_or_else(|| load_config().users.path);
    user_store::upsert_record(Path::new(&path), &username, &password)?;
    println!("用户 {username} 已写入 {path}");
    Ok(())
}
