use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct TourList {
    pub tours: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct TourOne {
    pub tour: Value,
}

/// `{"status": "success", "results": n, "data": {"tours": [...]}}`
#[derive(Debug, Serialize)]
pub struct TourListResponse {
    pub status: &'static str,
    pub results: usize,
    pub data: TourList,
}

impl TourListResponse {
    pub fn new(tours: Vec<Value>) -> Self {
        Self {
            status: "success",
            results: tours.len(),
            data: TourList { tours },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TourResponse {
    pub status: &'static str,
    pub data: TourOne,
}

impl TourResponse {
    pub fn new(tour: Value) -> Self {
        Self {
            status: "success",
            data: TourOne { tour },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsData {
    pub stats: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct PlanData {
    pub plan: Vec<Value>,
}

/// `{"status": "success", "data": {...}}` with no result count.
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub status: &'static str,
    pub data: T,
}

impl<T> DataResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            status: "success",
            data,
        }
    }
}
