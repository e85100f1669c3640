//! English and Chinese message catalog for API responses.
//!
//! Only the human-readable `error`/`message` strings are localized. Error
//! codes and every other field are identical in both languages.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Uri};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Locale {
    #[default]
    En,
    Zh,
}

impl Locale {
    /// Parse a language tag such as `zh`, `zh-CN` or `en-US;q=0.8`.
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.split(';').next().unwrap_or_default().trim();
        let primary = tag.split(['-', '_']).next().unwrap_or_default();
        if primary.eq_ignore_ascii_case("zh") {
            Some(Self::Zh)
        } else if primary.eq_ignore_ascii_case("en") {
            Some(Self::En)
        } else {
            None
        }
    }

    /// `?lang=` wins over `Accept-Language`; anything unrecognized is English.
    pub fn detect(uri: &Uri, headers: &HeaderMap) -> Self {
        let from_query = uri.query().and_then(|q| {
            q.split('&')
                .filter_map(|pair| pair.strip_prefix("lang="))
                .find_map(Self::parse)
        });
        if let Some(locale) = from_query {
            return locale;
        }

        headers
            .get(header::ACCEPT_LANGUAGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').find_map(Self::parse))
            .unwrap_or_default()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Locale {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::detect(&parts.uri, &parts.headers))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    AdminKeyNotConfigured,
    AdminKeyMissing,
    AdminKeyInvalid,
    MissingParams,
    InvalidPort,
    InvalidInstanceId,
    PortInUse,
    InstanceNotRunning,
    InstanceNotFound,
    ListInstancesFailed,
    CreateInstanceFailed,
    StopInstanceFailed,
    ResetPasswordFailed,
    DeleteInstanceFailed,
    DeleteIncomplete,
    CreateBackupFailed,
    InstanceDeleted,
}

impl Message {
    pub fn text(self, locale: Locale) -> &'static str {
        match locale {
            Locale::En => self.en(),
            Locale::Zh => self.zh(),
        }
    }

    fn en(self) -> &'static str {
        match self {
            Self::AdminKeyNotConfigured => "Admin key is not configured on the server",
            Self::AdminKeyMissing => "Missing admin key",
            Self::AdminKeyInvalid => "Invalid admin key",
            Self::MissingParams => "Missing required parameters",
            Self::InvalidPort => "Port must be an integer between 1024 and 65535",
            Self::InvalidInstanceId => "Invalid instance id",
            Self::PortInUse => "Port is already in use",
            Self::InstanceNotRunning => "Instance is not running",
            Self::InstanceNotFound => "Instance not found",
            Self::ListInstancesFailed => "Failed to list instances",
            Self::CreateInstanceFailed => "Failed to create instance",
            Self::StopInstanceFailed => "Failed to stop instance",
            Self::ResetPasswordFailed => "Failed to reset password",
            Self::DeleteInstanceFailed => "Failed to delete instance",
            Self::DeleteIncomplete => "Instance was only partially deleted",
            Self::CreateBackupFailed => "Failed to create backup",
            Self::InstanceDeleted => "Instance has been deleted",
        }
    }

    fn zh(self) -> &'static str {
        match self {
            Self::AdminKeyNotConfigured => "服务器未配置管理员密钥",
            Self::AdminKeyMissing => "缺少管理员密钥",
            Self::AdminKeyInvalid => "管理员密钥无效",
            Self::MissingParams => "缺少必要参数",
            Self::InvalidPort => "端口必须是 1024 到 65535 之间的整数",
            Self::InvalidInstanceId => "实例 ID 无效",
            Self::PortInUse => "端口已被占用",
            Self::InstanceNotRunning => "实例未在运行",
            Self::InstanceNotFound => "实例不存在",
            Self::ListInstancesFailed => "获取实例列表失败",
            Self::CreateInstanceFailed => "创建实例失败",
            Self::StopInstanceFailed => "停止实例失败",
            Self::ResetPasswordFailed => "重置密码失败",
            Self::DeleteInstanceFailed => "删除实例失败",
            Self::DeleteIncomplete => "实例未完全删除",
            Self::CreateBackupFailed => "创建备份失败",
            Self::InstanceDeleted => "实例已删除",
        }
    }
}
