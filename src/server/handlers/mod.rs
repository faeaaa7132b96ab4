//! HTTP 路由处理器

pub mod debug_api;
