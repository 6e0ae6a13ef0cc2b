use serde::Deserialize;

/// 统一的 API 响应包装结构体（包含 errCode、errMsg、data）
/// data 字段可能为 null 或缺失，因此使用 Option<T>
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    pub data: Option<T>,
}

/// 通用 HTTP 响应处理函数：直接反序列化为统一的响应结构体
///
/// 返回 `ApiResponse<T>`，调用方根据需要处理 `data` 字段（可能为 None）
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> anyhow::Result<ApiResponse<T>> {
    use anyhow::Context;
    use tracing::{debug, error};

    let status = response.status();

    // body 只能读取一次
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);
    debug!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, body_str));
    }

    let api_resp: ApiResponse<T> = serde_json::from_slice(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })?;

    if api_resp.err_code != 0 {
        error!(
            "[HTTP] {}服务器错误，错误码: {}, 错误信息: {}",
            operation_name, api_resp.err_code, api_resp.err_msg
        );
        return Err(anyhow::anyhow!(
            "服务器错误 {}: {}",
            api_resp.err_code,
            api_resp.err_msg
        ));
    }

    Ok(api_resp)
}

/// 取出 `data` 字段，缺失时报错
pub fn require_data<T>(resp: ApiResponse<T>) -> anyhow::Result<T> {
    resp.data
        .ok_or_else(|| anyhow::anyhow!("响应中缺少 data 字段"))
}
