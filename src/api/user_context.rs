// 请求内的已鉴权身份。由鉴权中间件写入，处理器只读。

/// 鉴权中间件解析出的调用者用户名。
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);
