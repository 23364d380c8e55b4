/// Allowed deviation of the device-reported limit, as a share of the rating
pub(crate) const LIMIT_TOLERANCE_RATIO: f64 = 0.05;

/// Whether `reported` lies strictly inside `commanded ± rated * 5 %`
pub(crate) fn within_band(commanded: i64, reported: f64, rated_watt: i64) -> bool {
    let band = rated_watt as f64 * LIMIT_TOLERANCE_RATIO;
    let low = commanded as f64 - band;
    let high = commanded as f64 + band;
    low.min(high) < reported && reported < low.max(high)
}

impl super::ZeroExportController {
    /// Compare each available inverter's reported limit with the last
    /// commanded one and resend it when it drifted out of band. No
    /// acknowledgment wait; the next allocation pass verifies.
    pub async fn reconcile(&mut self) {
        for idx in self.registry.ids() {
            if !self.registry.state(idx).available {
                continue;
            }
            let Some(commanded) = self.registry.state(idx).commanded_limit else {
                continue;
            };
            let logger = self
                .logger
                .for_inverter(idx, &self.registry.state(idx).serial);

            let reported = match self.driver.get_actual_limit_w(idx).await {
                Ok(w) => w,
                Err(e) => {
                    logger.error(&format!("Reading actual limit failed: {}", e));
                    continue;
                }
            };
            if within_band(commanded, reported, self.registry.spec(idx).rated_watt) {
                continue;
            }

            logger.info(&format!(
                "Limit check: DTU ( {:.1} ) <> SetLimit ( {} ). Resending limit",
                reported, commanded
            ));
            if let Err(e) = self.driver.set_limit(idx, commanded).await {
                logger.error(&format!("Resending limit failed: {}", e));
            }
        }
    }
}
