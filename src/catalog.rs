// 上游接口目录：启动时加载一次，运行期只读。
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub example_params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    categories: Vec<CategorySpec>,
}

pub struct Catalog {
    categories: Vec<CategorySpec>,
    names: HashSet<String>,
}

impl Catalog {
    pub fn load(path: &str) -> Result<Self> {
        let path = Path::new(path);
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取接口目录失败: {}", path.display()))?;
        let document = serde_json::from_str::<CatalogDocument>(&content)
            .with_context(|| format!("解析接口目录失败: {}", path.display()))?;
        Self::from_categories(document.categories)
    }

    pub fn from_categories(categories: Vec<CategorySpec>) -> Result<Self> {
        let mut names = HashSet::new();
        for category in &categories {
            for interface in &category.interfaces {
                let name = interface.name.trim();
                if name.is_empty() {
                    return Err(anyhow!("接口目录包含空接口名"));
                }
                names.insert(name.to_string());
            }
        }
        if names.is_empty() {
            return Err(anyhow!("接口目录为空"));
        }
        Ok(Self { categories, names })
    }

    pub fn has(&self, name: &str) -> bool {
        self.names.contains(name.trim())
    }

    pub fn categories(&self) -> &[CategorySpec] {
        &self.categories
    }

    /// 扁平接口清单，按目录文档顺序排列。
    pub fn list(&self) -> Vec<&InterfaceSpec> {
        self.categories
            .iter()
            .flat_map(|category| category.interfaces.iter())
            .collect()
    }

    /// 为系统提示词拼接接口说明，供模型选择接口与参数。
    pub fn format_for_prompt(&self) -> String {
        let mut output =
            String::from("可用的数据接口列表如下，请根据用户问题选择最合适的接口：\n\n");
        for interface in self.list() {
            output.push_str(&format!("- 接口: '{}'\n", interface.name));
            if !interface.description.trim().is_empty() {
                output.push_str(&format!("  描述: {}\n", interface.description));
            }
            if !interface.example_params.is_empty() {
                let params = interface
                    .example_params
                    .iter()
                    .map(|(key, value)| format!("{key}: {value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                output.push_str(&format!("  参数示例: {params}\n"));
            }
            output.push('\n');
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_catalog() -> Catalog {
        let document = json!({
            "categories": [
                {
                    "name": "股票",
                    "description": "A股数据",
                    "interfaces": [
                        {
                            "name": "stock_zh_a_hist",
                            "description": "A股历史行情",
                            "example_params": {
                                "symbol": "600519",
                                "period": "daily",
                                "start_date": "20230101",
                                "end_date": "20231231"
                            }
                        },
                        {"name": "stock_zh_a_spot_em", "description": "A股实时行情"}
                    ]
                }
            ]
        });
        let categories =
            serde_json::from_value::<Vec<CategorySpec>>(document["categories"].clone()).unwrap();
        Catalog::from_categories(categories).unwrap()
    }

    #[test]
    fn test_has_is_a_closed_set() {
        let catalog = sample_catalog();
        assert!(catalog.has("stock_zh_a_hist"));
        assert!(catalog.has(" stock_zh_a_spot_em "));
        assert!(!catalog.has("made_up_interface"));
    }

    #[test]
    fn test_list_keeps_document_order() {
        let catalog = sample_catalog();
        let names = catalog
            .list()
            .iter()
            .map(|spec| spec.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["stock_zh_a_hist", "stock_zh_a_spot_em"]);
    }

    #[test]
    fn test_prompt_lists_example_params_in_order() {
        let catalog = sample_catalog();
        let prompt = catalog.format_for_prompt();
        assert!(prompt.contains("stock_zh_a_hist"));
        let symbol = prompt.find("symbol").unwrap();
        let end_date = prompt.find("end_date").unwrap();
        assert!(symbol < end_date);
    }

    #[test]
    fn test_empty_catalog_rejected() {
        assert!(Catalog::from_categories(Vec::new()).is_err());
    }
}
