//! Duo CV is [Embassy](https://embassy.dev)-based firmware for a two-channel USB MIDI-to-CV module running on the
//! [Nucleo-F767ZI development board](https://www.st.com/en/evaluation-tools/nucleo-f767zi.html).
//!
//! MIDI channels 1 and 2 each drive one [CV/gate](https://en.wikipedia.org/wiki/CV/gate) pair. Both CV outputs can be
//! calibrated against the VCOs they control: hold the calibration button while powering on, then follow the stages
//! described in [`duo_cv_lib::calibration`].
//!
//! Pin assignments:
//!
//! - CV 1 and CV 2: PA4 and PA5 (DAC channels 1 and 2, through the output amplifiers)
//! - gates 1 and 2: PG0 and PG1
//! - calibration button: PD1, to ground
//! - switch bank: PF0 (switch 1) through PF7 (switch 8), to ground
//! - VCO frequency input: PC6, square wave conditioned to 3.3 V logic
//! - status: the board's green (PB0), blue (PB7) and red (PB14) LEDs, described in [`duo_cv_lib::indicator`]

#![no_std]
#![no_main]

// must come first so the logging macros are visible to the modules below
mod fmt;

mod panel;
mod storage;

use crate::{panel::Panel, storage::FlashEeprom};
use duo_cv_lib::{
    calibration::{CalibrationController, CalibrationStatus},
    channel::Channel,
    compensation::VoltageCompensator,
    configuration::{CalibrationConfig, ConverterProfile},
    frequency::EdgeCapture,
    indicator::Indicator,
    outputs::CvOutputs,
    performance::{Operation, Performance},
    store::CalibrationStore,
};
use embassy_executor::{InterruptExecutor, Spawner};
use embassy_stm32::{
    Config,
    adc::{Adc, SampleTime, VrefInt},
    bind_interrupts,
    dac::{Dac, DacCh1, DacCh2, Value},
    exti::ExtiInput,
    flash::Flash,
    gpio::{Input, Level, Output, Pull, Speed},
    interrupt::{self, InterruptExt, Priority},
    mode::{Async, Blocking},
    peripherals::{self, ADC1, DAC1},
    time::Hertz,
    usb,
};
use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    watch::{AnonReceiver, Sender, Watch},
};
use embassy_time::{Duration, Instant, Ticker};
use embassy_usb::{Builder, UsbDevice, class::midi::MidiClass, driver::EndpointError};
use static_cell::StaticCell;

#[cfg(feature = "debug")]
use {defmt_rtt as _, panic_probe as _};

#[cfg(not(feature = "debug"))]
use panic_halt as _;

bind_interrupts!(
    #[doc(hidden)]
    struct Irqs {
        OTG_FS => usb::InterruptHandler<peripherals::USB_OTG_FS>;
    }
);

type UsbDriver = usb::Driver<'static, peripherals::USB_OTG_FS>;
type Controller = CalibrationController<FlashEeprom<Flash<'static, Blocking>>>;

const PERFORMANCE_RECEIVER_CNT: usize = 0;
type PerformanceSync = Watch<CriticalSectionRawMutex, Performance, PERFORMANCE_RECEIVER_CNT>;
type PerformanceSender<'a> =
    Sender<'a, CriticalSectionRawMutex, Performance, PERFORMANCE_RECEIVER_CNT>;
type PerformanceSpy<'a> =
    AnonReceiver<'a, CriticalSectionRawMutex, Performance, PERFORMANCE_RECEIVER_CNT>;

/// Synchronizes what is being played.
static PERFORMANCE_SYNC: PerformanceSync = Watch::new();

/// Timestamps of the VCO's falling edges, filled from the EXTI interrupt and drained by the control loop.
static EDGE_CAPTURE: EdgeCapture = EdgeCapture::new();

const STATUS_RECEIVER_CNT: usize = 0;
type StatusSync = Watch<CriticalSectionRawMutex, CalibrationStatus, STATUS_RECEIVER_CNT>;
type StatusSender<'a> =
    Sender<'a, CriticalSectionRawMutex, CalibrationStatus, STATUS_RECEIVER_CNT>;
type StatusSpy<'a> =
    AnonReceiver<'a, CriticalSectionRawMutex, CalibrationStatus, STATUS_RECEIVER_CNT>;

/// Publishes the calibration session to the status LEDs.
static STATUS_SYNC: StatusSync = Watch::new();

/// Runs edge timestamping ahead of everything on the thread executor, so an edge is stamped as soon as it arrives.
static EDGE_EXECUTOR: InterruptExecutor = InterruptExecutor::new();

#[interrupt]
unsafe fn UART4() {
    unsafe { EDGE_EXECUTOR.on_interrupt() }
}

/// Period of the control loop.
const CONTROL_PERIOD: Duration = Duration::from_millis(1);

/// Period at which the status LEDs are refreshed.
const STATUS_PERIOD: Duration = Duration::from_millis(20);

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Initializing Duo CV");

    let mut config = Config::default();
    {
        use embassy_stm32::rcc::*;
        // hse: high-speed external clock
        config.rcc.hse = Some(Hse {
            freq: Hertz(8_000_000),
            mode: HseMode::Bypass,
        });

        // pll: phase-locked loop, crucial for dividing clock
        config.rcc.pll_src = PllSource::HSE;
        config.rcc.pll = Some(Pll {
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL216,
            divp: Some(PllPDiv::DIV2), // 8mhz / 4 * 216 / 2 = 216Mhz
            // per section 5.2 of RM0410, the 48MHz clock used for USB OTG FS is derived from the main PLL VCO (PLLQ clock)
            divq: Some(PllQDiv::DIV9), // 8mhz / 4 * 216 / 9 = 48Mhz
            divr: None,
        });
        config.rcc.ahb_pre = AHBPrescaler::DIV1;
        config.rcc.apb1_pre = APBPrescaler::DIV4;
        config.rcc.apb2_pre = APBPrescaler::DIV2;
        config.rcc.sys = Sysclk::PLL1_P;
        config.rcc.mux.clk48sel = mux::Clk48sel::PLL1_Q;
    }
    let p = embassy_stm32::init(config);

    let panel = Panel::new(
        Input::new(p.PD1, Pull::Up),
        [
            Input::new(p.PF0, Pull::Up),
            Input::new(p.PF1, Pull::Up),
            Input::new(p.PF2, Pull::Up),
            Input::new(p.PF3, Pull::Up),
            Input::new(p.PF4, Pull::Up),
            Input::new(p.PF5, Pull::Up),
            Input::new(p.PF6, Pull::Up),
            Input::new(p.PF7, Pull::Up),
        ],
    );

    // the button must be sampled before anything else so a session can begin
    let store = CalibrationStore::new(FlashEeprom::new(Flash::new_blocking(p.FLASH)));
    let controller = CalibrationController::new(
        store,
        &CalibrationConfig::default(),
        panel.read().calibration_button,
        Instant::now(),
    );

    // UART4 is unused and serves as the software interrupt driving the edge executor
    interrupt::UART4.set_priority(Priority::P6);
    let edge_spawner = EDGE_EXECUTOR.start(interrupt::UART4);
    let vco = ExtiInput::new(p.PC6, p.EXTI6, Pull::Up);
    unwrap!(edge_spawner.spawn(edge_task(vco)));

    // Create the driver, from the HAL.
    static ENDPOINT_OUT_BUFFER: StaticCell<[u8; 256]> = StaticCell::new();
    let mut config = embassy_stm32::usb::Config::default();

    // USB devices which are self-powered (i.e., that can stay powered on if unplugged from the host)
    // need to enable vbus_detection to comply with the USB spec. Per section 6.10 of the Nucleo board
    // manual (UM1974), CN13 (the USB port) cannot power the board; external power is necessary.
    config.vbus_detection = true;

    let driver = usb::Driver::new_fs(
        p.USB_OTG_FS,
        Irqs,
        p.PA12,
        p.PA11,
        ENDPOINT_OUT_BUFFER.init([0; 256]),
        config,
    );

    // per https://pid.codes, 0x1209/0x0001 is the shared test PID for FOSS projects
    let vendor_id = 0x1209;
    let product_id = 0x0001;

    let mut config = embassy_usb::Config::new(vendor_id, product_id);
    config.manufacturer = Some("Pawpaw Works");
    config.product = Some("Duo CV");
    config.self_powered = true;
    config.max_power = 0;

    static CONFIG_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    static BOS_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    static CONTROL_BUFFER: StaticCell<[u8; 64]> = StaticCell::new();

    let mut builder = Builder::new(
        driver,
        config,
        CONFIG_DESCRIPTOR.init([0; 256]),
        BOS_DESCRIPTOR.init([0; 256]),
        &mut [], // no msos descriptors
        CONTROL_BUFFER.init([0; 64]),
    );

    let class = MidiClass::new(&mut builder, 0, 1, 64);
    let usb = builder.build();

    // per RM0410, DAC channel 1 outputs on port A, pin 4 and channel 2 on pin 5
    let (dac_ch1, dac_ch2) = Dac::new(p.DAC1, p.DMA1_CH5, p.DMA1_CH6, p.PA4, p.PA5).split();

    // the supply voltage is inferred from the internal reference
    let mut adc = Adc::new(p.ADC1);
    adc.set_sample_time(SampleTime::CYCLES480);
    let vrefint = adc.enable_vrefint();

    let gates = [
        Output::new(p.PG0, Level::Low, Speed::Low),
        Output::new(p.PG1, Level::Low, Speed::Low),
    ];

    unwrap!(spawner.spawn(usb_task(usb)));

    let performance_sender = PERFORMANCE_SYNC.sender();
    performance_sender.send(Performance::new());
    unwrap!(spawner.spawn(midi_task(class, performance_sender)));

    let leds = [
        Output::new(p.PB0, Level::Low, Speed::Low),
        Output::new(p.PB7, Level::Low, Speed::Low),
        Output::new(p.PB14, Level::Low, Speed::Low),
    ];
    let status_sender = STATUS_SYNC.sender();
    status_sender.send(controller.status());
    unwrap!(spawner.spawn(status_task(leds, STATUS_SYNC.anon_receiver())));

    unwrap!(spawner.spawn(control_task(
        controller,
        panel,
        adc,
        vrefint,
        dac_ch1,
        dac_ch2,
        gates,
        PERFORMANCE_SYNC.anon_receiver(),
        status_sender,
    )));
}

/// Timestamps each falling edge of the VCO under calibration. Runs on [`EDGE_EXECUTOR`].
#[embassy_executor::task]
async fn edge_task(mut vco: ExtiInput<'static>) -> ! {
    loop {
        vco.wait_for_falling_edge().await;
        EDGE_CAPTURE.record_edge(Instant::now());
    }
}

/// Runs once per [`CONTROL_PERIOD`]: measures the supply, advances calibration or voices the performance, and writes
/// both DAC channels.
#[allow(clippy::too_many_arguments)]
#[embassy_executor::task]
async fn control_task(
    mut controller: Controller,
    panel: Panel,
    mut adc: Adc<'static, ADC1>,
    mut vrefint: VrefInt,
    mut dac_ch1: DacCh1<'static, DAC1, Async>,
    mut dac_ch2: DacCh2<'static, DAC1, Async>,
    mut gates: [Output<'static>; 2],
    mut performance: PerformanceSpy<'static>,
    status: StatusSender<'static>,
) -> ! {
    let mut compensator = VoltageCompensator::new(ConverterProfile::default());
    let mut outputs = CvOutputs::new();
    let mut ticker = Ticker::every(CONTROL_PERIOD);

    loop {
        ticker.next().await;
        let now = Instant::now();
        compensator.measure_supply(adc.blocking_read(&mut vrefint));

        if controller.is_active() {
            controller.poll(panel.read(), &EDGE_CAPTURE, &compensator, &mut outputs, now);
            status.send_if_modified(|current| {
                let latest = controller.status();
                let modified = *current != Some(latest);
                *current = Some(latest);
                modified
            });
            // the VCO must keep sounding for the frequency meter, so no envelope should be triggered
            for gate in gates.iter_mut() {
                gate.set_low();
            }
        } else if let Some(state) = performance.try_get() {
            for channel in Channel::ALL {
                // when all keys have been released, the oscillator is meant to retain the frequency of the last played note
                if let Some(cents) = state.target_cents(channel) {
                    outputs.set_channel(channel, controller.note_to_voltage(channel, cents));
                }
                gates[channel.index()].set_level(state.gate(channel).into());
            }
        }

        let [first, second] = compensator.codes(&outputs, &controller.gain_offsets());
        dac_ch1.set(Value::Bit12Right(first));
        dac_ch2.set(Value::Bit12Right(second));
    }
}

/// Shows the calibration session on the green, blue and red LEDs; dark while no session runs.
#[embassy_executor::task]
async fn status_task(mut leds: [Output<'static>; 3], mut status: StatusSpy<'static>) -> ! {
    let indicator = Indicator::new(&CalibrationConfig::default());
    let mut ticker = Ticker::every(STATUS_PERIOD);
    loop {
        ticker.next().await;
        let Some(latest) = status.try_get() else {
            continue;
        };
        let frame = indicator.render(&latest, Instant::now());
        let [green, blue, red] = &mut leds;
        green.set_level(frame.green.into());
        blue.set_level(frame.blue.into());
        red.set_level(frame.red.into());
    }
}

#[embassy_executor::task]
async fn usb_task(mut usb: UsbDevice<'static, UsbDriver>) -> ! {
    usb.run().await
}

#[embassy_executor::task]
async fn midi_task(
    mut class: MidiClass<'static, UsbDriver>,
    mut performance: PerformanceSender<'static>,
) -> ! {
    loop {
        class.wait_connection().await;
        info!("USB connected");
        let _ = process_midi(&mut class, &mut performance).await;
        info!("USB disconnected");
    }
}

#[doc(hidden)]
struct Disconnected {}

impl From<EndpointError> for Disconnected {
    fn from(val: EndpointError) -> Self {
        match val {
            EndpointError::BufferOverflow => panic!("Buffer overflow"),
            EndpointError::Disabled => Disconnected {},
        }
    }
}

/// Helper function which interprets data received over USB and publishes the resulting [`Performance`].
async fn process_midi<'d, T: usb::Instance + 'd>(
    class: &mut MidiClass<'d, usb::Driver<'d, T>>,
    performance: &mut PerformanceSender<'static>,
) -> Result<(), Disconnected> {
    let mut buf = [0; 64];
    loop {
        let n = class.read_packet(&mut buf).await?;
        let mut state = performance.try_get().unwrap_or_default();
        let operation = state.update(&buf[..n]);
        if operation != Operation::none() {
            performance.send(state);
        }
    }
}
