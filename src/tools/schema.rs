//! 工具参数 JSON Schema 生成（schemars）
//!
//! 工具把参数定义成 `#[derive(Deserialize, JsonSchema)]` 结构体，由这里生成发给模型的 parameters。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 生成参数类型 T 的 JSON Schema，去掉模型端不需要的 `$schema` / `title`
pub fn input_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object", "properties": {} })
    });
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Args {
        /// 文件路径
        path: String,
        overwrite: Option<bool>,
    }

    #[test]
    fn test_schema_lists_required_fields() {
        let schema = input_schema::<Args>();
        assert_eq!(schema["type"], "object");
        assert!(schema.get("$schema").is_none());
        assert_eq!(schema["required"], serde_json::json!(["path"]));
        assert!(schema["properties"]["overwrite"].is_object());
    }
}
