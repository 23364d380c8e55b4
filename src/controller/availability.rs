impl super::ZeroExportController {
    /// Poll reachability of every inverter. Returns true if at least one is
    /// available. A failed query marks that inverter unavailable for this
    /// iteration; an inverter coming back is reset and re-identified. Any
    /// change of the available set forces the next allocation to be sent.
    pub async fn refresh_availability(&mut self) -> bool {
        let mut any_available = false;
        for idx in self.registry.ids() {
            let was_available = self.registry.state(idx).available;
            let reachable = if self.registry.spec(idx).enabled {
                self.driver.get_available(idx).await
            } else {
                Ok(false)
            };

            match reachable {
                Ok(available) => {
                    self.registry.state_mut(idx).available = available;
                    if available != was_available {
                        self.aggregate.invalidate();
                    }
                    if !available {
                        continue;
                    }
                    any_available = true;
                    if !was_available {
                        self.logger
                            .for_inverter(idx, &self.registry.state(idx).serial)
                            .info("Inverter became available, resetting runtime state");
                        self.registry.state_mut(idx).reset_on_reconnect();
                        self.refresh_info(idx).await;
                    }
                }
                Err(e) => {
                    self.registry.state_mut(idx).available = false;
                    if was_available {
                        self.aggregate.invalidate();
                    }
                    self.logger
                        .for_inverter(idx, &self.registry.state(idx).serial)
                        .error(&format!("Inverter not reachable: {}", e));
                }
            }
        }
        any_available
    }

    /// Refresh serial, name and temperature from the device
    async fn refresh_info(&mut self, idx: usize) {
        match self.driver.get_info(idx).await {
            Ok(info) => {
                let state = self.registry.state_mut(idx);
                if !info.serial.is_empty() {
                    state.serial = info.serial;
                }
                if !info.name.is_empty() {
                    state.name = info.name;
                }
                state.temperature = info.temperature;
            }
            Err(e) => {
                self.logger
                    .for_inverter(idx, &self.registry.state(idx).serial)
                    .error(&format!("Reading inverter info failed: {}", e));
            }
        }
    }

    /// Read and log every inverter's temperature
    pub async fn log_temperatures(&mut self) {
        for idx in self.registry.ids() {
            let logger = self
                .logger
                .for_inverter(idx, &self.registry.state(idx).serial);
            match self.driver.get_temperature(idx).await {
                Ok(t) => {
                    self.registry.state_mut(idx).temperature = Some(t);
                    logger.info(&format!(
                        "Inverter \"{}\" temperature: {:.1} degC",
                        self.registry.state(idx).name,
                        t
                    ));
                }
                Err(e) => logger.error(&format!("Reading temperature failed: {}", e)),
            }
        }
    }
}
