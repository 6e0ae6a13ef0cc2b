//! 降级通道的增量帧解码器
//!
//! 响应体由空行分隔成帧，每帧取最后一个非空字段（有 `data` 字段时取最后一个 `data`）
//! 作为负载。网络读取不保证与帧对齐：分隔符、甚至一个多字节字符都可能被拆到两次读取中，
//! 所以在看到完整分隔符之前一律缓冲。

#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// 尚未凑成完整 UTF-8 字符的字节
    pending: Vec<u8>,
    /// 尚未凑成完整帧的文本
    text: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一段字节，返回其中所有完整帧的负载
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        self.decode_available();
        if self.text.contains('\r') {
            self.text = self.text.replace("\r\n", "\n");
        }

        let mut payloads = Vec::new();
        while let Some(idx) = self.text.find("\n\n") {
            let block: String = self.text.drain(..idx + 2).collect();
            if let Some(payload) = Self::block_payload(&block) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// 响应体结束：冲刷最后一个没有以空行结尾的帧
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.text.push_str(&tail);
            self.pending.clear();
        }
        let block = std::mem::take(&mut self.text).replace("\r\n", "\n");
        Self::block_payload(&block)
    }

    fn decode_available(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    self.text.push_str(s);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.text
                        .push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        // 字符被截断，等下一段字节
                        None => {
                            self.pending.drain(..valid);
                            return;
                        }
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn block_payload(block: &str) -> Option<String> {
        let mut last_field: Option<&str> = None;
        let mut last_data: Option<&str> = None;

        for line in block.split('\n') {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (name, value) = Self::split_field(line);
            if value.trim().is_empty() {
                continue;
            }
            if name == Some("data") {
                last_data = Some(value);
            }
            last_field = Some(value);
        }

        last_data.or(last_field).map(str::to_string)
    }

    /// `name: value` 形式的行拆成字段；名字不是简单标识符时整行都是值
    fn split_field(line: &str) -> (Option<&str>, &str) {
        if let Some((name, value)) = line.split_once(':') {
            let is_ident = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if is_ident {
                return (Some(name), value.strip_prefix(' ').unwrap_or(value));
            }
        }
        (None, line)
    }
}
