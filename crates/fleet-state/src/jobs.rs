//! Upload records and export jobs.

use redb::ReadableTable;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, decode, encode, next_id};
use crate::tables::*;
use crate::types::*;

const UPLOAD_SEQ: &str = "uploads";
const EXPORT_SEQ: &str = "export_jobs";

impl StateStore {
    /// Insert an upload record, assigning its id.
    pub fn create_upload(&self, record: &UploadRecord) -> StateResult<UploadRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        {
            let id = next_id(&txn, UPLOAD_SEQ)?;
            stored = UploadRecord {
                id,
                ..record.clone()
            };
            let mut table = txn.open_table(UPLOADS).map_err(map_err!(Table))?;
            table
                .insert(id, encode(&stored)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = stored.id, file = %stored.file_name, "upload recorded");
        Ok(stored)
    }

    pub fn get_upload(&self, id: RowId) -> StateResult<Option<UploadRecord>> {
        self.get_row(UPLOADS, id)
    }

    pub fn list_uploads(&self) -> StateResult<Vec<UploadRecord>> {
        self.list_rows(UPLOADS, |_: &UploadRecord| true)
    }

    /// Insert an export job, assigning its id.
    pub fn create_export_job(&self, job: &ExportJob) -> StateResult<ExportJob> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        {
            let id = next_id(&txn, EXPORT_SEQ)?;
            stored = ExportJob { id, ..job.clone() };
            let mut table = txn.open_table(EXPORT_JOBS).map_err(map_err!(Table))?;
            table
                .insert(id, encode(&stored)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    /// Replace an existing export job.
    pub fn put_export_job(&self, job: &ExportJob) -> StateResult<()> {
        if self.get_export_job(job.id)?.is_none() {
            return Err(StateError::NotFound(format!("export job {}", job.id)));
        }
        self.put_row(EXPORT_JOBS, job.id, job)
    }

    pub fn get_export_job(&self, id: RowId) -> StateResult<Option<ExportJob>> {
        self.get_row(EXPORT_JOBS, id)
    }

    /// Move a job from `Ready` to `Doing` and return it. Only one caller can
    /// win the claim; every other sees `Invalid`.
    pub fn claim_export_job(&self, id: RowId) -> StateResult<ExportJob> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed;
        {
            let mut jobs = txn.open_table(EXPORT_JOBS).map_err(map_err!(Table))?;
            let found: Option<ExportJob> = jobs
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            let mut job = found.ok_or_else(|| StateError::NotFound(format!("export job {id}")))?;
            if job.status != JobStatus::Ready {
                return Err(StateError::Invalid(format!(
                    "export job {id} is {:?}, not ready",
                    job.status
                )));
            }
            job.status = JobStatus::Doing;
            jobs.insert(id, encode(&job)?.as_slice())
                .map_err(map_err!(Write))?;
            claimed = job;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id, "export job claimed");
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ExportJob {
        ExportJob {
            id: 0,
            category: "gse_plugin".to_string(),
            project: "basereport".to_string(),
            version: "1.0".to_string(),
            status: JobStatus::Ready,
            file_path: None,
            error_message: String::new(),
            creator: "admin".to_string(),
            source_app_code: "fleet".to_string(),
            created_at: 1,
            finished_at: None,
        }
    }

    #[test]
    fn upload_ids_are_assigned() {
        let store = StateStore::open_in_memory().unwrap();
        let record = UploadRecord {
            id: 0,
            file_name: "bundle.tgz".to_string(),
            module: "gse_plugin".to_string(),
            file_path: "/upload/bundle.tgz".to_string(),
            file_size: 10,
            checksum: "abc".to_string(),
            creator: "admin".to_string(),
            source_app_code: "fleet".to_string(),
            uploaded_at: 1,
        };
        let a = store.create_upload(&record).unwrap();
        let b = store.create_upload(&record).unwrap();
        assert_eq!(a.id + 1, b.id);
        assert_eq!(store.get_upload(a.id).unwrap().unwrap().file_name, "bundle.tgz");
        assert_eq!(store.list_uploads().unwrap().len(), 2);
    }

    #[test]
    fn export_job_update() {
        let store = StateStore::open_in_memory().unwrap();
        let mut stored = store.create_export_job(&job()).unwrap();
        stored.status = JobStatus::Success;
        store.put_export_job(&stored).unwrap();
        let loaded = store.get_export_job(stored.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Success);
    }

    #[test]
    fn export_job_is_claimed_once() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.create_export_job(&job()).unwrap();

        let claimed = store.claim_export_job(stored.id).unwrap();
        assert_eq!(claimed.status, JobStatus::Doing);
        assert_eq!(
            store.get_export_job(stored.id).unwrap().unwrap().status,
            JobStatus::Doing
        );

        let err = store.claim_export_job(stored.id).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
        let err = store.claim_export_job(99).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.create_export_job(&job()).unwrap().id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.claim_export_job(id).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn updating_missing_job_fails() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.put_export_job(&ExportJob { id: 7, ..job() }).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }
}
