use thiserror::Error;

/// 接收器对累计字节的判定。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// 已得到一个完整请求（含消息体）。
    Valid,
    /// 字节流无法构成合法请求；需 `clear` 后才能继续使用。
    Invalid,
    /// 尚需更多字节。
    Incomplete,
}

/// 请求接收器：把零散到达的字节块增量拼装为请求。
///
/// # 契约（What）
/// - `receive` 可被多次调用，每次传入新到达的字节；返回 `Valid` 后
///   [`request`](Self::request) 与 [`body`](Self::body) 可读，直到 `clear`；
/// - `clear` 丢弃当前请求，但保留已收到、尚未消费的后续字节；
/// - 返回 `Invalid` 后接收器停留在失败状态，继续喂入字节仍返回 `Invalid`。
pub trait RequestReceiver {
    fn receive(&mut self, data: &[u8]) -> Verdict;

    fn request(&self) -> &Request;

    fn body(&self) -> &[u8];

    fn clear(&mut self);
}

/// 解析出的请求头部。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    method: String,
    target: String,
    major: u8,
    minor: u8,
    headers: Vec<(String, String)>,
}

impl Default for Request {
    /// 尚未解析时按 HTTP/1.1 处理，拒绝响应沿用该版本。
    fn default() -> Self {
        Self {
            method: String::new(),
            target: String::new(),
            major: 1,
            minor: 1,
            headers: Vec::new(),
        }
    }
}

impl Request {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// `(major, minor)` 版本号。
    pub fn version(&self) -> (u8, u8) {
        (self.major, self.minor)
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// 按名称（大小写不敏感）查找首个头部值。
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// 响应后是否保持连接。
    ///
    /// `Connection: close` 总是关闭；HTTP/1.1 及以上默认保持，HTTP/1.0 需显式 `keep-alive`。
    pub fn keep_alive(&self) -> bool {
        let tokens = |token: &str| {
            self.header("connection").is_some_and(|value| {
                value
                    .split(',')
                    .any(|item| item.trim().eq_ignore_ascii_case(token))
            })
        };
        if tokens("close") {
            return false;
        }
        (self.major, self.minor) >= (1, 1) || tokens("keep-alive")
    }
}

/// 请求无法解析的原因。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request head is not valid utf-8")]
    Encoding,
    #[error("malformed request line `{0}`")]
    RequestLine(String),
    #[error("unsupported http version `{0}`")]
    Version(String),
    #[error("malformed header line `{0}`")]
    Header(String),
    #[error("invalid content-length `{0}`")]
    ContentLength(String),
    #[error("transfer-encoding `{0}` is not supported")]
    TransferEncoding(String),
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),
}

/// 默认的请求头部上限。
pub const DEFAULT_MAX_HEAD_SIZE: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Head,
    Body { remaining: usize },
    Done,
    Failed,
}

/// 最小 HTTP/1.x 接收器：请求行、头部与按 `Content-Length` 定长的消息体。
///
/// 不支持分块传输编码；遇到 `Transfer-Encoding` 直接判为 `Invalid`。
#[derive(Debug)]
pub struct HeadRequestReceiver {
    pending: Vec<u8>,
    request: Request,
    body: Vec<u8>,
    phase: Phase,
    max_head_size: usize,
    error: Option<RequestError>,
}

impl Default for HeadRequestReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadRequestReceiver {
    pub fn new() -> Self {
        Self::with_max_head_size(DEFAULT_MAX_HEAD_SIZE)
    }

    pub fn with_max_head_size(max_head_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            request: Request::default(),
            body: Vec::new(),
            phase: Phase::Head,
            max_head_size,
            error: None,
        }
    }

    /// 最近一次 `Invalid` 的原因。
    pub fn error(&self) -> Option<&RequestError> {
        self.error.as_ref()
    }

    fn advance(&mut self) -> Verdict {
        loop {
            match self.phase {
                Phase::Head => {
                    let Some(end) = find_head_end(&self.pending) else {
                        if self.pending.len() > self.max_head_size {
                            return self.reject(RequestError::HeadTooLarge(self.max_head_size));
                        }
                        return Verdict::Incomplete;
                    };
                    if end > self.max_head_size {
                        return self.reject(RequestError::HeadTooLarge(self.max_head_size));
                    }
                    let head: Vec<u8> = self.pending.drain(..end + 4).collect();
                    match parse_head(&head[..end]) {
                        Ok((request, length)) => {
                            self.request = request;
                            self.phase = Phase::Body { remaining: length };
                        }
                        Err(error) => return self.reject(error),
                    }
                }
                Phase::Body { remaining } => {
                    let take = remaining.min(self.pending.len());
                    self.body.extend(self.pending.drain(..take));
                    if take < remaining {
                        self.phase = Phase::Body {
                            remaining: remaining - take,
                        };
                        return Verdict::Incomplete;
                    }
                    self.phase = Phase::Done;
                }
                Phase::Done => return Verdict::Valid,
                Phase::Failed => return Verdict::Invalid,
            }
        }
    }

    fn reject(&mut self, error: RequestError) -> Verdict {
        self.error = Some(error);
        self.phase = Phase::Failed;
        Verdict::Invalid
    }
}

impl RequestReceiver for HeadRequestReceiver {
    fn receive(&mut self, data: &[u8]) -> Verdict {
        if self.phase != Phase::Failed {
            self.pending.extend_from_slice(data);
        }
        self.advance()
    }

    fn request(&self) -> &Request {
        &self.request
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn clear(&mut self) {
        if self.phase == Phase::Failed {
            self.pending.clear();
        }
        self.request = Request::default();
        self.body.clear();
        self.phase = Phase::Head;
        self.error = None;
    }
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_head(head: &[u8]) -> Result<(Request, usize), RequestError> {
    let text = std::str::from_utf8(head).map_err(|_| RequestError::Encoding)?;
    let mut lines = text.split("\r\n");
    let line = lines.next().unwrap_or_default();

    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RequestError::RequestLine(line.to_owned()));
    };
    if method.is_empty()
        || !method.bytes().all(is_token_byte)
        || target.is_empty()
    {
        return Err(RequestError::RequestLine(line.to_owned()));
    }
    let (major, minor) = parse_version(version)?;

    let mut headers = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(RequestError::Header(line.to_owned()));
        };
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(RequestError::Header(line.to_owned()));
        }
        headers.push((name.to_owned(), value.trim().to_owned()));
    }

    let request = Request {
        method: method.to_owned(),
        target: target.to_owned(),
        major,
        minor,
        headers,
    };
    if let Some(encoding) = request.header("transfer-encoding") {
        return Err(RequestError::TransferEncoding(encoding.to_owned()));
    }
    let length = content_length(&request)?;
    Ok((request, length))
}

fn parse_version(text: &str) -> Result<(u8, u8), RequestError> {
    let invalid = || RequestError::Version(text.to_owned());
    let digits = text.strip_prefix("HTTP/").ok_or_else(invalid)?;
    let (major, minor) = digits.split_once('.').ok_or_else(invalid)?;
    let digit = |part: &str| match part.as_bytes() {
        [d] if d.is_ascii_digit() => Some(d - b'0'),
        _ => None,
    };
    match (digit(major), digit(minor)) {
        (Some(1), Some(minor)) => Ok((1, minor)),
        _ => Err(invalid()),
    }
}

/// 多个 `Content-Length` 必须一致；缺省为 0。
fn content_length(request: &Request) -> Result<usize, RequestError> {
    let mut length = None;
    for (_, value) in request
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("content-length"))
    {
        let parsed = value
            .parse::<usize>()
            .map_err(|_| RequestError::ContentLength(value.clone()))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(RequestError::ContentLength(value.clone()));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length.unwrap_or(0))
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}
