//! Audit trail emission.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use vsdm_evidence_core::{
    encode_check_digit, AccessRequest, AuditEntry, AuditRepresentation, EvidenceRecord, Kvnr,
    TelematikId, ValidationError, Verdict,
};
use vsdm_evidence_store::AuditLog;

use crate::error::Result;

/// Writes one audit entry per access attempt.
pub struct AuditTrailEmitter<A: AuditLog> {
    log: Arc<A>,
}

impl<A: AuditLog> AuditTrailEmitter<A> {
    pub fn new(log: Arc<A>) -> Self {
        Self { log }
    }

    /// Record an attempt.
    pub async fn emit(
        &self,
        actor: &TelematikId,
        subject: Option<Kvnr>,
        representation: AuditRepresentation,
        now: DateTime<Utc>,
        evidence: Option<String>,
    ) -> Result<AuditEntry> {
        let entry = AuditEntry::new(actor.clone(), subject, representation, now, evidence);
        self.log.append(&entry).await?;
        debug!(entry = %entry.id, representation = %representation, "audit entry written");
        Ok(entry)
    }

    /// Record the outcome of a validated attempt.
    pub async fn emit_outcome(
        &self,
        actor: &TelematikId,
        request: &AccessRequest,
        record: Option<&EvidenceRecord>,
        outcome: &std::result::Result<Verdict, ValidationError>,
        now: DateTime<Utc>,
    ) -> Result<AuditEntry> {
        let representation = AuditRepresentation::for_outcome(outcome);
        let evidence = match outcome {
            Ok(verdict) => verdict.record.check_digit.as_ref().map(encode_check_digit),
            Err(_) => None,
        };
        self.emit(actor, attribute(request, record), representation, now, evidence)
            .await
    }

    /// The audit trail of a patient, newest first.
    pub async fn history(&self, subject: &Kvnr) -> Result<Vec<AuditEntry>> {
        Ok(self.log.entries_for(subject).await?)
    }
}

/// The patient an attempt is attributed to: the identity parameter if it is
/// well-formed, else the subject of the decoded check digit.
pub fn attribute(request: &AccessRequest, record: Option<&EvidenceRecord>) -> Option<Kvnr> {
    request.identity().or_else(|| {
        record
            .and_then(|r| r.check_digit.as_ref())
            .map(|d| *d.subject())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsdm_evidence_core::{Assurance, EvidenceResult};
    use vsdm_evidence_store::MemoryStore;

    fn actor() -> TelematikId {
        TelematikId::parse("3-SMC-B-Testkarte-883110000116873").unwrap()
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_736_870_400, 0).unwrap()
    }

    #[tokio::test]
    async fn test_emit_and_history() {
        let emitter = AuditTrailEmitter::new(Arc::new(MemoryStore::new()));
        let subject = Kvnr::parse("X110498565").unwrap();

        let request = AccessRequest::new("token").with_kvnr("X110498565");
        let verdict = Verdict {
            subject,
            assurance: Assurance::Pn3Reduced,
            record: EvidenceRecord::offline(EvidenceResult::UpdatesTechnicallyImpossible, now()),
        };
        let entry = emitter
            .emit_outcome(&actor(), &request, None, &Ok(verdict), now())
            .await
            .unwrap();
        assert_eq!(entry.representation, AuditRepresentation::PharmacyGetTaskSuccessfulPn3);
        assert_eq!(entry.evidence, None);

        let history = emitter.history(&subject).await.unwrap();
        assert_eq!(history, vec![entry]);
    }

    #[test]
    fn test_attribution_prefers_identity_parameter() {
        let request = AccessRequest::new("token").with_kvnr("X110498565");
        assert_eq!(attribute(&request, None), Kvnr::parse("X110498565").ok());

        let malformed = AccessRequest::new("token").with_kvnr("nope");
        assert_eq!(attribute(&malformed, None), None);

        let offline = EvidenceRecord::offline(EvidenceResult::NoUpdatesNeeded, now());
        assert_eq!(attribute(&malformed, Some(&offline)), None);
    }
}
