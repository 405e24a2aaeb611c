use futures::{FutureExt, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{Decoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::proto::{
    codec::ProtocolCodec,
    command::{Command, Input, ShapingTime},
    conv,
    port::{Connector, Port, SerialConnector},
    response::Response,
    ProtoError, Result,
};
use crate::settings::{SessionConfig, Startup};
use crate::spectrum::Spectrum;

/// Identity line the URSA-II answers the probe with.
pub const IDENT: &str = "URSA2";

// Stop requests sent before giving up on a chatty instrument.
const STOP_ROUNDS: usize = 64;

fn rejected(err: ProtoError) -> ProtoError {
    error!("{}", err);
    err
}

/// Polls granted to a ramp wait: the configured margin plus the expected
/// ramp time of `span` volts at `ramp_seconds` per 100 V.
fn ramp_polls(config: &SessionConfig, ramp_seconds: Option<u16>, span: u16) -> usize {
    let per_100v = u64::from(ramp_seconds.unwrap_or(conv::MIN_RAMP));
    let ramp_ms = per_100v * u64::from(span) * 1000 / 100;
    let poll_ms = config.timeout.as_millis().max(1) as u64;
    config.ramp_polls + ((ramp_ms + poll_ms - 1) / poll_ms) as usize
}

/// Session with one URSA-II.
///
/// All commands go through `&mut self`, so a reply is always awaited
/// before the next command is written. The decoded spectrum lives in a
/// shared [`Spectrum`] that other tasks may read at any time.
pub struct Device {
    connector: Box<dyn Connector>,
    config: SessionConfig,
    stream: Option<Framed<Port, ProtocolCodec>>,
    spectrum: Arc<Spectrum>,
    cancel: CancellationToken,
    connected: bool,
    responsive: bool,
    acquiring: bool,
    geiger: bool,
    ramp_seconds: Option<u16>,
    last_voltage: Option<u16>,
}

impl Device {
    /// Session for a serial port. Nothing is opened until [`Device::connect`].
    pub fn new(com: impl AsRef<str>, baudrate: u32) -> Self {
        Self::with_config(com, baudrate, SessionConfig::default())
    }

    pub fn with_config(com: impl AsRef<str>, baudrate: u32, config: SessionConfig) -> Self {
        let connector = SerialConnector::new(com.as_ref(), baudrate).timeout(config.timeout);
        Self::with_connector(connector, config)
    }

    pub fn with_connector(connector: impl Connector + 'static, config: SessionConfig) -> Self {
        Self {
            connector: Box::new(connector),
            config,
            stream: None,
            spectrum: Arc::new(Spectrum::new()),
            cancel: CancellationToken::new(),
            connected: false,
            responsive: false,
            acquiring: false,
            geiger: false,
            ramp_seconds: None,
            last_voltage: None,
        }
    }

    pub fn spectrum(&self) -> Arc<Spectrum> {
        self.spectrum.clone()
    }

    /// Last battery reading in volts.
    pub fn battery(&self) -> f32 {
        self.spectrum.battery()
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    pub fn is_geiger_mode(&self) -> bool {
        self.geiger
    }

    pub fn ramp_seconds(&self) -> Option<u16> {
        self.ramp_seconds
    }

    pub fn last_voltage(&self) -> Option<u16> {
        self.last_voltage
    }

    /// Token that aborts a running high voltage ramp wait.
    pub fn ramp_canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Open the port and check that an URSA-II answers.
    pub async fn connect(&mut self) -> Result<()> {
        for attempt in 1..=self.config.connect_attempts {
            if self.stream.is_some() {
                break;
            }
            match self.connector.open() {
                Ok(port) => {
                    self.stream = Some(ProtocolCodec::default().framed(port));
                    // The instrument may still be streaming from a previous session.
                    if let Err(err) = self.stop_acquire().await {
                        warn!("Reset after opening {} failed: {}", self.connector.name(), err);
                    }
                    self.connected = true;
                    info!("Opened serial port {}", self.connector.name());
                }
                Err(err) => warn!(
                    "Unable to connect to serial port {} (attempt {}): {}",
                    self.connector.name(),
                    attempt,
                    err
                ),
            }
        }
        if !self.connected {
            error!("Unable to open serial port {}", self.connector.name());
            return Err(ProtoError::NotConnected);
        }

        for attempt in 1..=self.config.handshake_attempts {
            if self.check_comms().await {
                self.responsive = true;
                info!("URSA connected on {}", self.connector.name());
                return Ok(());
            }
            self.responsive = false;
            warn!("URSA not responding (attempt {})", attempt);
        }
        error!("Unable to communicate with URSA");
        Err(ProtoError::NotResponsive)
    }

    /// Connected and answering, re-probing if the last handshake failed.
    pub async fn connected(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        if !self.responsive {
            self.responsive = self.check_comms().await;
        }
        self.responsive
    }

    async fn check_comms(&mut self) -> bool {
        match self.probe().await {
            Ok(ident) if ident == IDENT => true,
            Ok(ident) => {
                warn!("Unexpected identity {:?}", ident);
                false
            }
            Err(err) => {
                debug!("Probe failed: {}", err);
                false
            }
        }
    }

    async fn probe(&mut self) -> Result<String> {
        self.stop_acquire().await?;
        self.discard_pending()?;
        self.transmit(Command::Probe).await?;
        self.read_line().await
    }

    /// Release the port after stopping acquisition and high voltage.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        let stopped = self.stop_acquire().await;
        let zeroed = self.stop_voltage().await;
        self.stream = None;
        self.connected = false;
        self.responsive = false;
        info!("Released serial port {}", self.connector.name());
        stopped.and(zeroed)
    }

    fn stream(&mut self) -> Result<&mut Framed<Port, ProtocolCodec>> {
        self.stream.as_mut().ok_or(ProtoError::NotConnected)
    }

    /// EEPROM settings are refused while acquiring.
    fn check_allowed(&self, cmd: &Command) -> Result<()> {
        if self.acquiring && cmd.is_persisted() {
            error!("Cannot send {:?} while acquiring", cmd);
            return Err(ProtoError::Busy);
        }
        Ok(())
    }

    async fn transmit(&mut self, cmd: Command) -> Result<()> {
        self.check_allowed(&cmd)?;
        debug!("Transmitting {:?}", cmd);
        let (acquiring, geiger) = (self.acquiring, self.geiger);
        let stream = self.stream()?;
        if let Err(err) = stream.send(cmd).await {
            error!("Serial write failed: {}", err);
            stream.codec_mut().set_mode(acquiring, geiger);
            stream.codec_mut().reset_reply();
            return Err(err.into());
        }
        sleep(self.config.settle).await;
        Ok(())
    }

    /// Next decoded item, `None` if nothing arrived within `wait`.
    async fn next_response(&mut self, wait: Duration) -> Result<Option<Response>> {
        let stream = self.stream()?;
        match timeout(wait, stream.next()).await {
            Ok(Some(Ok(response))) => Ok(Some(response)),
            Ok(Some(Err(ioerr))) => Err(ioerr.into()),
            Ok(None) => Err(ProtoError::Abort),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Next decoded item if one is available without waiting.
    fn poll_response(&mut self) -> Result<Option<Response>> {
        match self.stream()?.next().now_or_never() {
            Some(Some(Ok(response))) => Ok(Some(response)),
            Some(Some(Err(ioerr))) => Err(ioerr.into()),
            Some(None) => Err(ProtoError::Abort),
            None => Ok(None),
        }
    }

    /// Drop a half received reply after a timeout.
    fn reset_reply(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.codec_mut().reset_reply();
            stream.read_buffer_mut().clear();
        }
    }

    fn discard_pending(&mut self) -> Result<usize> {
        let mut discarded = 0;
        while let Some(response) = self.poll_response()? {
            debug!("Discarding {:?}", response);
            discarded += 1;
        }
        let leftover = self.stream()?.read_buffer_mut();
        if !leftover.is_empty() {
            debug!("Discarding {} undecoded bytes", leftover.len());
            leftover.clear();
            discarded += 1;
        }
        Ok(discarded)
    }

    fn handle(&self, response: Response) {
        match response {
            Response::Pulse(pulse) => self.spectrum.apply(&pulse),
            Response::Battery(raw) => {
                let volts = self.spectrum.set_battery_raw(raw);
                debug!("Battery at {:.2} V", volts);
            }
            Response::Desync(dropped) => {
                warn!("Read error, dropping {} bytes: {:02X?}", dropped.len(), &dropped[..])
            }
            other => debug!("Ignoring {:?}", other),
        }
    }

    /// Decode everything received so far into the spectrum.
    ///
    /// Never waits for data. Returns the number of decoded items.
    pub fn read(&mut self) -> Result<usize> {
        let mut decoded = 0;
        while let Some(response) = self.poll_response()? {
            self.handle(response);
            decoded += 1;
        }
        Ok(decoded)
    }

    async fn read_line(&mut self) -> Result<String> {
        match self.next_response(self.config.timeout).await? {
            Some(Response::Line(line)) => Ok(line),
            Some(other) => {
                self.reset_reply();
                Err(other.into())
            }
            None => {
                self.reset_reply();
                Err(ProtoError::Timeout)
            }
        }
    }

    fn ensure_idle(&self, what: &str) -> Result<()> {
        if self.acquiring {
            error!("Cannot {} while acquiring", what);
            return Err(ProtoError::Busy);
        }
        Ok(())
    }

    pub async fn start_acquire(&mut self) -> Result<()> {
        if self.acquiring {
            warn!("Already acquiring");
            return Ok(());
        }
        self.transmit(Command::StartAcquire).await?;
        self.acquiring = true;
        info!("Acquisition started");
        Ok(())
    }

    /// Stop acquiring and wait until the instrument stops sending.
    pub async fn stop_acquire(&mut self) -> Result<()> {
        let mut quiet = false;
        for _ in 0..STOP_ROUNDS {
            self.discard_pending()?;
            self.transmit(Command::StopAcquire).await?;
            sleep(self.config.stop_settle).await;
            if self.discard_pending()? == 0 {
                quiet = true;
                break;
            }
        }
        if !quiet {
            warn!("URSA still sending after {} stop requests", STOP_ROUNDS);
        }
        if self.acquiring {
            info!("Acquisition stopped");
        }
        self.acquiring = false;
        Ok(())
    }

    pub async fn start_gm(&mut self) -> Result<()> {
        if self.acquiring {
            warn!("Already acquiring, not entering Geiger mode");
            return Ok(());
        }
        self.transmit(Command::EnterGeiger).await?;
        self.geiger = true;
        self.start_acquire().await
    }

    pub async fn stop_gm(&mut self) -> Result<()> {
        if self.acquiring {
            if let Err(err) = self.stop_acquire().await {
                warn!("Stopping acquisition failed: {}", err);
            }
        }
        self.transmit(Command::LeaveGeiger).await?;
        self.geiger = false;
        Ok(())
    }

    /// Counts since the previous request, Geiger mode only.
    pub async fn request_counts(&mut self) -> Result<u32> {
        if !(self.geiger && self.acquiring) {
            return Err(rejected(ProtoError::NotGeigerMode));
        }
        self.discard_pending()?;
        self.transmit(Command::RequestCounts).await?;
        match self.next_response(self.config.timeout).await? {
            Some(Response::Counts(counts)) => Ok(counts),
            Some(other) => {
                self.reset_reply();
                Err(rejected(other.into()))
            }
            None => {
                self.reset_reply();
                Err(rejected(ProtoError::Timeout))
            }
        }
    }

    /// Ask for a battery reading.
    ///
    /// While a spectrum is streaming the reading arrives with the frames
    /// and is picked up by the next [`Device::read`], `None` is returned.
    pub async fn request_battery(&mut self) -> Result<Option<f32>> {
        let streaming = self.acquiring && !self.geiger;
        if !streaming {
            self.discard_pending()?;
        }
        self.transmit(Command::RequestBattery).await?;
        if streaming {
            return Ok(None);
        }
        match self.next_response(self.config.timeout).await? {
            Some(Response::Battery(raw)) => Ok(Some(self.spectrum.set_battery_raw(raw))),
            Some(other) => {
                self.reset_reply();
                Err(other.into())
            }
            None => {
                self.reset_reply();
                Err(ProtoError::Timeout)
            }
        }
    }

    pub async fn request_serial_number(&mut self) -> Result<u32> {
        self.ensure_idle("request serial number")?;
        self.discard_pending()?;
        self.transmit(Command::RequestSerialNumber).await?;
        let line = self.read_line().await?;
        let serial = line
            .parse::<u32>()
            .map_err(|_| rejected(ProtoError::InvalidReply(line.clone())))?;
        info!("The serial number is: {}", serial);
        Ok(serial)
    }

    /// Highest high voltage the instrument supports, in volts.
    pub async fn request_max_voltage(&mut self) -> Result<u32> {
        self.ensure_idle("request max voltage")?;
        self.discard_pending()?;
        self.transmit(Command::RequestMaxVoltage).await?;
        let line = self.read_line().await?;
        line.parse::<u32>()
            .map_err(|_| rejected(ProtoError::InvalidReply(line.clone())))
    }

    /// Switch off the high voltage immediately, allowed at any time.
    pub async fn stop_voltage(&mut self) -> Result<()> {
        self.transmit(Command::StopVoltage).await
    }

    /// Do not store the next voltage in EEPROM.
    pub async fn set_no_save(&mut self) -> Result<()> {
        self.transmit(Command::SetNoSave).await
    }

    /// Set the high voltage and wait until the ramp finished.
    pub async fn set_voltage(&mut self, volts: u16) -> Result<()> {
        let value = conv::voltage_to_wire(volts).map_err(rejected)?;
        let cmd = Command::SetVoltage(value);
        self.check_allowed(&cmd)?;
        self.discard_pending()?;
        if volts == 0 {
            self.transmit(Command::SetNoSave).await?;
        }
        self.transmit(cmd).await?;
        let span = volts.abs_diff(self.last_voltage.unwrap_or(0));
        self.last_voltage = Some(volts);
        info!("High voltage set to {} V", volts);
        let polls = ramp_polls(&self.config, self.ramp_seconds, span);
        self.wait_for_ramp(polls).await
    }

    /// Restore the settings stored in EEPROM, including high voltage.
    pub async fn load_previous_settings(&mut self) -> Result<()> {
        self.check_allowed(&Command::LoadPrevious)?;
        self.discard_pending()?;
        self.transmit(Command::LoadPrevious).await?;
        // Ramp and target voltage come from EEPROM and are unknown here.
        self.ramp_seconds = None;
        self.last_voltage = None;
        let polls = ramp_polls(&self.config, Some(conv::MAX_RAMP), conv::MAX_VOLTAGE);
        self.wait_for_ramp(polls).await
    }

    async fn wait_for_ramp(&mut self, polls: usize) -> Result<()> {
        let cancel = self.cancel.clone();
        let delay = self.config.ramp_delay;
        let interrupted = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = sleep(delay) => false,
        };
        if interrupted {
            return Err(self.ramp_cancelled());
        }

        let wait = self.config.timeout;
        for _ in 0..polls {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                polled = self.next_response(wait) => Some(polled),
            };
            match polled {
                None => return Err(self.ramp_cancelled()),
                Some(Ok(Some(response))) => {
                    self.handle(response);
                    self.discard_pending()?;
                    return Ok(());
                }
                Some(Ok(None)) => {
                    debug!("Still ramping");
                    self.transmit(Command::RequestBattery).await?;
                }
                Some(Err(err)) => return Err(err),
            }
        }
        self.reset_reply();
        warn!("No reply while waiting for the high voltage ramp");
        Err(ProtoError::Timeout)
    }

    fn ramp_cancelled(&mut self) -> ProtoError {
        warn!("High voltage ramp wait cancelled");
        self.cancel = CancellationToken::new();
        self.reset_reply();
        ProtoError::Cancelled
    }

    pub async fn set_gain(&mut self, gain: f64) -> Result<()> {
        let setting = conv::gain_to_wire(gain).map_err(rejected)?;
        info!(
            "Setting coarse gain {} and fine gain to: {}, effective gain {:.3}",
            setting.coarse as char,
            setting.fine_fraction(),
            setting.gain()
        );
        self.transmit(Command::SetGain {
            coarse: setting.coarse,
            fine: setting.fine,
        })
        .await
    }

    pub async fn set_input(&mut self, input: Input) -> Result<()> {
        self.transmit(Command::SetInput(input)).await
    }

    pub async fn set_shaping_time(&mut self, time: ShapingTime) -> Result<()> {
        self.transmit(Command::SetShapingTime(time)).await
    }

    pub async fn set_threshold_offset(&mut self, millivolts: u16) -> Result<()> {
        let bytes = conv::threshold_to_wire(millivolts).map_err(rejected)?;
        self.transmit(Command::SetThreshold(bytes)).await
    }

    /// ADC resolution, 8 to 12 bits.
    pub async fn set_bit_mode(&mut self, bits: u8) -> Result<()> {
        let mode = conv::bit_mode_to_wire(bits).map_err(rejected)?;
        self.transmit(Command::SetBitMode(mode)).await
    }

    /// Ramp time in seconds per 100 V.
    pub async fn set_ramp(&mut self, seconds: u16) -> Result<()> {
        let value = conv::ramp_to_wire(seconds).map_err(rejected)?;
        self.transmit(Command::SetRamp(value)).await?;
        self.ramp_seconds = Some(seconds);
        Ok(())
    }

    pub async fn no_ramp(&mut self) -> Result<()> {
        self.transmit(Command::NoRamp).await?;
        self.ramp_seconds = None;
        Ok(())
    }

    /// ASCII output is not decoded by this driver, the stream will desync.
    pub async fn start_ascii(&mut self) -> Result<()> {
        warn!("ASCII mode output is not supported by the decoder");
        self.transmit(Command::StartAscii).await
    }

    pub async fn stop_ascii(&mut self) -> Result<()> {
        self.transmit(Command::StopAscii).await
    }

    /// Factory only.
    pub async fn set_serial_number(&mut self, serial: u32) -> Result<()> {
        let serial = conv::check_serial_number(serial).map_err(rejected)?;
        self.transmit(Command::ProgramSerialNumber).await?;
        self.transmit(Command::SerialNumber(serial)).await?;
        sleep(self.config.serial_settle).await;
        Ok(())
    }

    /// Factory only.
    pub async fn set_smudge_factor(&mut self, smudge: u8) -> Result<()> {
        let smudge = conv::check_smudge(smudge).map_err(rejected)?;
        self.transmit(Command::SetSmudge(smudge)).await
    }

    pub async fn set_alarm0(&mut self, enable: bool) -> Result<()> {
        self.transmit(Command::Alarm0(enable)).await
    }

    pub async fn set_alarm1(&mut self, enable: bool) -> Result<()> {
        self.transmit(Command::Alarm1(enable)).await
    }

    /// Bring the instrument into a known configuration.
    ///
    /// A profile is validated as a whole before the first command is sent.
    pub async fn configure(&mut self, startup: &Startup) -> Result<()> {
        match startup {
            Startup::LoadPrevious => self.load_previous_settings().await,
            Startup::Apply(settings) => {
                self.ensure_idle("configure")?;
                settings.validate().map_err(rejected)?;
                self.set_gain(settings.gain).await?;
                self.set_threshold_offset(settings.threshold).await?;
                self.set_shaping_time(settings.shaping_time).await?;
                self.set_input(settings.input).await?;
                self.set_ramp(settings.ramp).await?;
                self.set_voltage(settings.high_voltage).await
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Best effort only, a drop cannot wait for the port.
        if let Some(stream) = self.stream.as_mut() {
            for cmd in [Command::StopAcquire, Command::StopVoltage] {
                if !matches!(stream.send(cmd).now_or_never(), Some(Ok(()))) {
                    warn!("Could not switch off URSA on drop");
                    break;
                }
            }
        }
    }
}
