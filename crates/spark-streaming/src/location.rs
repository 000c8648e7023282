use std::{fmt, sync::Arc};

/// 流在流水线中的来源位置，例如 `orders-flow/processors/2`。
///
/// 对本子系统而言这是一个不透明的描述符，只用于拼装错误信息与日志字段，从不解析其结构。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComponentLocation(Arc<str>);

impl ComponentLocation {
    pub fn new(location: impl Into<Arc<str>>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentLocation {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ComponentLocation {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
