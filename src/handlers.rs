use crate::models::{ApiResponse, LeaseStatus};
use crate::worker_lease::WorkerLease;
use actix_web::{web, HttpResponse};
use log::info;
use std::sync::Arc;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(lease_status),
    components(schemas(LeaseStatus, ApiResponse<LeaseStatus>)),
    tags(
        (name = "lease", description = "Worker lease status")
    ),
    info(
        title = "Worker Lease API",
        version = "0.1.0",
        description = "Read-only view of this worker's leader election state",
    )
)]
pub struct ApiDoc;

/// Current lease state of this worker
#[utoipa::path(
    get,
    path = "/api/lease/status",
    tag = "lease",
    responses(
        (status = 200, description = "Lease state of this instance", body = ApiResponse<LeaseStatus>)
    )
)]
pub async fn lease_status(worker: web::Data<Arc<WorkerLease>>) -> HttpResponse {
    let status = worker.status();
    info!(
        "[STATUS] Lease status requested - instance_id: {}, held: {}",
        status.instance_id, status.held
    );
    HttpResponse::Ok().json(ApiResponse::success(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::ElectionAllocator;
    use crate::clock::SystemClock;
    use crate::config::WorkerLeaseOptions;
    use crate::storage::memory::MemoryStorage;
    use crate::telemetry::LogTelemetry;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn status_reports_unheld_worker() {
        let clock = Arc::new(SystemClock);
        let telemetry = Arc::new(LogTelemetry);
        let options = WorkerLeaseOptions::new("returns-processor", 2);
        let allocator = ElectionAllocator::new(
            Arc::new(MemoryStorage::new(clock.clone())),
            options.clone(),
            clock.clone(),
            telemetry.clone(),
        );
        let worker = Arc::new(
            WorkerLease::new(options, Arc::new(allocator), clock, telemetry).unwrap(),
        );

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(worker.clone()))
                .route("/api/lease/status", web::get().to(lease_status)),
        )
        .await;
        let req = test::TestRequest::get().uri("/api/lease/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["worker_type"], "returns-processor");
        assert_eq!(body["data"]["priority"], 2);
        assert_eq!(body["data"]["held"], false);
        assert_eq!(body["data"]["instance_id"], worker.instance_id().to_string());
    }
}
