use std::fmt::Write as _;

/// 常用响应状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    NoContent,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    PayloadTooLarge,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::NoContent => 204,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
            Status::PayloadTooLarge => 413,
            Status::InternalServerError => 500,
            Status::NotImplemented => 501,
            Status::ServiceUnavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Created => "Created",
            Status::NoContent => "No Content",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::PayloadTooLarge => "Payload Too Large",
            Status::InternalServerError => "Internal Server Error",
            Status::NotImplemented => "Not Implemented",
            Status::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// 待发送的响应头部；消息体由调用方单独提供。
///
/// 版本默认 HTTP/1.1，经 [`HttpConnection`](crate::HttpConnection) 发送时改为请求的版本。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    status: Status,
    major: u8,
    minor: u8,
    headers: Vec<(String, String)>,
    content_length: usize,
}

impl Response {
    pub fn new(status: Status, content_length: usize) -> Self {
        Self {
            status,
            major: 1,
            minor: 1,
            headers: Vec::new(),
            content_length,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn set_version(&mut self, major: u8, minor: u8) {
        self.major = major;
        self.minor = minor;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn version(&self) -> (u8, u8) {
        (self.major, self.minor)
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// 渲染状态行与头部，`Content-Length` 总是最后一个头部。
    pub fn message(&self) -> String {
        let mut text = format!(
            "HTTP/{}.{} {} {}\r\n",
            self.major,
            self.minor,
            self.status.code(),
            self.status.reason()
        );
        for (name, value) in &self.headers {
            let _ = write!(text, "{name}: {value}\r\n");
        }
        let _ = write!(text, "Content-Length: {}\r\n\r\n", self.content_length);
        text
    }
}
