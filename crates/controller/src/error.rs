/// Why a reconciliation attempt failed. Every variant leaves stored state as it was.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] keel_core::Error),
    /// The transform rejected its input; not retried here.
    #[error("{controller}: transform failed: {source:#}")]
    Transform { controller: String, source: anyhow::Error },
}

impl ReconcileError {
    pub fn transform(controller: &str, source: anyhow::Error) -> Self {
        Self::Transform { controller: controller.to_string(), source }
    }

    pub fn is_cancelled(&self) -> bool { matches!(self, ReconcileError::Store(e) if e.is_cancelled()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_errors_name_the_controller() {
        let e = ReconcileError::transform("RedactCtrl", anyhow::anyhow!("bad yaml"));
        let s = e.to_string();
        assert!(s.contains("RedactCtrl") && s.contains("bad yaml"), "s={s}");
        assert!(!e.is_cancelled());
        assert!(ReconcileError::from(keel_core::Error::Cancelled).is_cancelled());
    }
}
