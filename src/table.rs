// 表格数据模型：入口处统一归一化为有序列 + 标量单元格。
use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// 标量单元格。上游返回的非标量值在入口处被确定性转成文本。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    pub fn from_json(value: &Value) -> Cell {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(flag) => Cell::Bool(*flag),
            Value::Number(num) => number_cell(num),
            Value::String(text) => Cell::Text(text.clone()),
            other => {
                let canonical = canonicalize_json(other);
                Cell::Text(serde_json::to_string(&canonical).unwrap_or_default())
            }
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(flag) => Value::Bool(*flag),
            Cell::Int(value) => Value::Number((*value).into()),
            Cell::Float(value) => Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::Text(text) => Value::String(text.clone()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(value) => Some(*value as f64),
            Cell::Float(value) => Some(*value),
            Cell::Text(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        }
    }
}

fn number_cell(num: &Number) -> Cell {
    if let Some(value) = num.as_i64() {
        return Cell::Int(value);
    }
    match num.as_f64() {
        // NaN/无穷大不会出现在 JSON 数字里，但经由反序列化仍做兜底。
        Some(value) if value.is_finite() => Cell::Float(value),
        _ => Cell::Null,
    }
}

/// 有序表格：列顺序在分页与序列化之间保持稳定。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    /// 从记录数组构建表格。列顺序取首次出现顺序，缺失字段补 Null。
    pub fn from_records(records: &[Value]) -> Result<Table, GatewayError> {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            let Value::Object(map) = record else {
                return Err(GatewayError::Parse("记录必须是对象".to_string()));
            };
            for key in map.keys() {
                if !columns.iter().any(|existing| existing == key) {
                    columns.push(key.clone());
                }
            }
        }
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let Value::Object(map) = record else {
                continue;
            };
            let row = columns
                .iter()
                .map(|column| map.get(column).map(Cell::from_json).unwrap_or(Cell::Null))
                .collect();
            rows.push(row);
        }
        Ok(Table { columns, rows })
    }

    pub fn record_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// 按行区间切片，保留列顺序。
    pub fn slice(&self, start: usize, end: usize) -> Table {
        let end = end.min(self.rows.len());
        let start = start.min(end);
        Table {
            columns: self.columns.clone(),
            rows: self.rows[start..end].to_vec(),
        }
    }

    /// 序列化为记录数组，字段顺序与列顺序一致。
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let mut map = Map::new();
                for (column, cell) in self.columns.iter().zip(row.iter()) {
                    map.insert(column.clone(), cell.to_json());
                }
                Value::Object(map)
            })
            .collect()
    }

    pub fn serialized_len(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

/// 对象键排序后的规范化 JSON，保证语义相同的值得到字节一致的文本。
pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().cloned().collect::<Vec<_>>();
            keys.sort();
            let mut ordered = Map::new();
            for key in keys {
                if let Some(entry) = map.get(&key) {
                    ordered.insert(key, canonicalize_json(entry));
                }
            }
            Value::Object(ordered)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_records_keeps_field_order() {
        let records = vec![
            json!({"日期": "2024-01-02", "收盘": 10.5, "成交量": 1200}),
            json!({"日期": "2024-01-03", "收盘": 11, "成交量": 900}),
        ];
        let table = Table::from_records(&records).unwrap();
        assert_eq!(table.columns, vec!["日期", "收盘", "成交量"]);
        assert_eq!(table.record_count(), 2);
        assert_eq!(table.rows[1][1], Cell::Int(11));
    }

    #[test]
    fn test_ragged_records_union_columns() {
        let records = vec![json!({"a": 1}), json!({"a": 2, "b": "x"})];
        let table = Table::from_records(&records).unwrap();
        assert_eq!(table.columns, vec!["a", "b"]);
        assert_eq!(table.rows[0][1], Cell::Null);
    }

    #[test]
    fn test_non_scalar_cell_stringified_deterministically() {
        let records = vec![json!({"meta": {"b": 1, "a": 2}})];
        let table = Table::from_records(&records).unwrap();
        assert_eq!(
            table.rows[0][0],
            Cell::Text("{\"a\":2,\"b\":1}".to_string())
        );
    }

    #[test]
    fn test_records_round_trip_is_byte_stable() {
        let records = vec![json!({"date": "2024-01-01", "price": "10"})];
        let table = Table::from_records(&records).unwrap();
        let first = serde_json::to_vec(&table.to_records()).unwrap();
        let second = serde_json::to_vec(&table.to_records()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_canonicalize_json_sorts_keys() {
        let value = json!({"b": [{"y": 1, "x": 2}], "a": 3});
        let canonical = canonicalize_json(&value);
        assert_eq!(
            serde_json::to_string(&canonical).unwrap(),
            "{\"a\":3,\"b\":[{\"x\":2,\"y\":1}]}"
        );
    }
}
