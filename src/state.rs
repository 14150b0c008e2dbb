// 全局状态：启动时装配各组件，经 State 注入处理器。
use crate::analyst::Analyst;
use crate::cache::DataCache;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::files::FileStore;
use crate::token_service::TokenService;
use crate::upstream::UpstreamInvoker;
use crate::user_store::UserStore;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub user_store: Arc<UserStore>,
    pub tokens: Arc<TokenService>,
    pub catalog: Arc<Catalog>,
    pub cache: Arc<DataCache>,
    pub invoker: Arc<UpstreamInvoker>,
    pub files: Arc<FileStore>,
    pub analyst: Arc<Analyst>,
}

impl AppState {
    /// 任何一步失败都视为不可恢复的启动错误，进程应以非零码退出。
    pub fn new(config: Config) -> Result<Self> {
        let secret = config
            .token_secret()
            .ok_or_else(|| anyhow!("缺少令牌签名密钥（security.token_secret 或 AKGATE_TOKEN_SECRET）"))?;
        let tokens = Arc::new(TokenService::new(
            &secret,
            config.security.token_ttl_minutes,
        ));
        let user_store =
            Arc::new(UserStore::load(&config.users.path).context("用户凭证加载失败")?);
        let catalog = Arc::new(Catalog::load(&config.catalog.path).context("接口目录加载失败")?);
        let cache = Arc::new(
            DataCache::new(
                &config.cache.root,
                config.cache.ceiling_bytes,
                config.cache.serve_stale_on_error,
            )
            .context("缓存目录初始化失败")?,
        );
        let files = Arc::new(
            FileStore::new(&config.files.root, config.files.max_upload_bytes)
                .context("用户文件目录初始化失败")?,
        );
        let http = reqwest::Client::new();
        let invoker = Arc::new(UpstreamInvoker::new(http.clone(), &config.upstream));
        let analyst = Arc::new(Analyst::new(
            config.llm.clone(),
            catalog.clone(),
            cache.clone(),
            invoker.clone(),
            files.clone(),
            http,
        ));
        Ok(Self {
            config,
            user_store,
            tokens,
            catalog,
            cache,
            invoker,
            files,
            analyst,
        })
    }
}
