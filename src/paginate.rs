// 分页投影：越界参数收敛到合法区间，切片保持行列顺序。
use crate::table::Table;
use serde::Serialize;
use serde_json::Value;

pub const MIN_PAGE_SIZE: usize = 1;
pub const MAX_PAGE_SIZE: usize = 500;
pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct PageEnvelope {
    pub data: Vec<Value>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_records: usize,
}

fn clamp_page_size(page_size: usize) -> usize {
    page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

/// 对表格结果做 (page, page_size) 投影。越界时收敛而不是报错。
pub fn paginate(table: &Table, page: usize, page_size: usize) -> PageEnvelope {
    let page_size = clamp_page_size(page_size);
    let total_records = table.record_count();
    let total_pages = total_records.div_ceil(page_size).max(1);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * page_size;
    let end = start + page_size;
    let slice = table.slice(start, end);
    PageEnvelope {
        data: slice.to_records(),
        current_page: page,
        total_pages,
        total_records,
    }
}
