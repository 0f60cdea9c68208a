//! Mock-transport tests for the protocol core.
//!
//! The mock only special-cases bytes sent as `0xFF`: every `receive()` in
//! the driver clocks out `0xFF` to read a byte back, so any call whose
//! transmitted byte happens to be anything else (a command frame byte, a
//! data byte, a token) is a *send* and its return value is never inspected
//! by the driver. That lets the response script below be just the bytes
//! the card would actually reply with, in call order, without having to
//! pad it out with placeholders for every frame byte in between.
//!
//! One wrinkle: `write_data`'s two dummy CRC bytes are themselves literal
//! `0xFF`, so they consume a slot from the response queue exactly like a
//! real `receive()` would, even though the driver discards what comes back.
//! Every write-path script below carries two filler bytes (`0xAA`) right
//! after the command-ready byte to account for this before the real
//! data-response token.

use super::*;
use crate::transport::ActiveLevel;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

struct MockTransport {
    tx_log: Rc<RefCell<Vec<u8>>>,
    rx: VecDeque<u8>,
    time: Rc<RefCell<u32>>,
}

impl Transfer<u8> for MockTransport {
    type Error = ();

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
        for w in words.iter_mut() {
            self.tx_log.borrow_mut().push(*w);
            *self.time.borrow_mut() += 1;
            if *w == 0xFF {
                *w = self.rx.pop_front().unwrap_or(0xFF);
            }
        }
        Ok(words)
    }
}

struct MockCs {
    history: Rc<RefCell<Vec<bool>>>,
}

impl OutputPin for MockCs {
    type Error = ();

    fn set_high(&mut self) -> Result<(), ()> {
        self.history.borrow_mut().push(true);
        Ok(())
    }

    fn set_low(&mut self) -> Result<(), ()> {
        self.history.borrow_mut().push(false);
        Ok(())
    }
}

struct MockCd {
    present: bool,
}

impl InputPin for MockCd {
    type Error = ();

    fn is_high(&self) -> Result<bool, ()> {
        Ok(self.present)
    }

    fn is_low(&self) -> Result<bool, ()> {
        Ok(!self.present)
    }
}

struct MockClock {
    time: Rc<RefCell<u32>>,
}

impl Clock for MockClock {
    fn now_ms(&mut self) -> u32 {
        *self.time.borrow()
    }
}

struct MockDelay {
    time: Rc<RefCell<u32>>,
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        *self.time.borrow_mut() += ms;
    }
}

struct Harness {
    sd: SdMmc<MockTransport, MockCs, MockCd, MockClock, MockDelay>,
    tx_log: Rc<RefCell<Vec<u8>>>,
    cs_history: Rc<RefCell<Vec<bool>>>,
}

fn harness(rx: Vec<u8>, card_present: bool) -> Harness {
    let time = Rc::new(RefCell::new(0u32));
    let tx_log = Rc::new(RefCell::new(Vec::new()));
    let cs_history = Rc::new(RefCell::new(Vec::new()));

    let spi = MockTransport {
        tx_log: tx_log.clone(),
        rx: rx.into_iter().collect(),
        time: time.clone(),
    };
    let cs = MockCs {
        history: cs_history.clone(),
    };
    let cd = MockCd {
        present: card_present,
    };
    let clock = MockClock { time: time.clone() };
    let delay = MockDelay { time };

    let sd = SdMmc::new(spi, cs, cd, ActiveLevel::High, clock, delay);
    Harness {
        sd,
        tx_log,
        cs_history,
    }
}

/// 15 power-up clock bytes, each clocked with `0xFF`: value doesn't matter.
fn power_up() -> Vec<u8> {
    vec![0xFF; 15]
}

#[test]
fn scenario_sdhc_init() {
    let mut rx = power_up();
    rx.extend([
        0x01, // CMD0 -> idle
        0x01, // CMD8 -> idle (accepted)
        0x00, 0x00, 0x01, 0xAA, // CMD8 echo
        0x01, // CMD55 -> idle
        0x00, // ACMD41 -> ready
        0x00, // CMD58 -> ready
        0xC0, 0xFF, 0x80, 0x00, // OCR, bit 30 set: high-capacity
    ]);
    let mut h = harness(rx, true);

    h.sd.init().expect("init should succeed");

    assert_eq!(h.sd.card_version(), 2);
    assert!(h.sd.is_high_capacity());
    assert_eq!(h.sd.variant(), Some(CardVariant::SdV2Sdhc));

    // No CMD16 (0x50) should appear anywhere on the bus.
    assert!(!h.tx_log.borrow().windows(1).any(|w| w == [0x50]));
}

#[test]
fn scenario_sdsc_v2_init() {
    let mut rx = power_up();
    rx.extend([
        0x01, // CMD0
        0x01, // CMD8
        0x00, 0x00, 0x01, 0xAA, // echo
        0x01, // CMD55
        0x00, // ACMD41
        0x00, // CMD58
        0x00, 0xFF, 0x80, 0x00, // OCR, bit 30 clear: standard capacity
        0x00, // CMD16
    ]);
    let mut h = harness(rx, true);

    h.sd.init().expect("init should succeed");

    assert!(!h.sd.is_high_capacity());
    assert_eq!(h.sd.variant(), Some(CardVariant::SdV2Sdsc));

    // CMD16 (0x50) with argument 0x00000200 (512) was issued.
    let tx = h.tx_log.borrow();
    assert!(tx.windows(6).any(|w| w == [0x50, 0x00, 0x00, 0x02, 0x00, 0x01]));
}

#[test]
fn scenario_sd_v1_init() {
    let mut rx = power_up();
    rx.extend([
        0x01, // CMD0
        0x05, // CMD8 -> illegal command (R1_ILLEGAL_COMMAND | R1_IDLE_STATE)
        0x01, // CMD55 (variant probe)
        0x01, // ACMD41 (variant probe) -> idle, so this is SD v1
        0x01, // CMD55 (poll)
        0x00, // ACMD41 (poll) -> ready
        0x00, // CMD16
    ]);
    let mut h = harness(rx, true);

    h.sd.init().expect("init should succeed");

    assert_eq!(h.sd.card_version(), 1);
    assert_eq!(h.sd.card_type(), 1);
    assert_eq!(h.sd.variant(), Some(CardVariant::SdV1));
}

#[test]
fn init_fails_when_card_not_present() {
    let mut h = harness(Vec::new(), false);
    assert!(matches!(h.sd.init(), Err(Error::CardNotPresent)));
    // No bus traffic at all before the presence check.
    assert!(h.tx_log.borrow().is_empty());
}

#[test]
fn write_block_accepted() {
    let mut h = harness(
        vec![
            0x00, // CMD24 ready
            0xAA, 0xAA, // consumed by the two dummy CRC bytes, discarded
            0xE5, // data-response token, masked low nibble 0x05: accepted
            0x01, // busy-wait: non-zero means ready
        ],
        true,
    );
    h.sd.variant = Some(CardVariant::SdV2Sdhc);

    let data = [0u8; 512];
    h.sd.write_block(0x0000_0010, &data).expect("write should be accepted");

    let tx = h.tx_log.borrow();
    // CMD24 (0x18 | 0x40 = 0x58), argument 0x00000010, CRC disabled.
    assert!(tx.windows(6).any(|w| w == [0x58, 0x00, 0x00, 0x00, 0x10, 0x01]));
    // Dummy CRC trailer: literal 0xFF, 0xFF, right after the 512 data bytes.
    let token_pos = tx.iter().position(|&b| b == DATA_START_BLOCK).unwrap();
    assert_eq!(&tx[token_pos + 513..token_pos + 515], [0xFF, 0xFF]);
}

#[test]
fn write_block_rejected() {
    let mut h = harness(
        vec![
            0x00, // CMD24 ready
            0xAA, 0xAA, // consumed by the two dummy CRC bytes, discarded
            0xEB, // data-response token, masked low nibble 0x0B: CRC error
        ],
        true,
    );
    h.sd.variant = Some(CardVariant::SdV2Sdhc);

    let data = [0u8; 512];
    let result = h.sd.write_block(0x0000_0010, &data);

    assert!(matches!(result, Err(Error::WriteBlockFailed)));
    assert_eq!(h.cs_history.borrow().last(), Some(&true));
}

#[test]
fn sector_count_v2() {
    let mut rx = vec![0x00, 0xFE]; // CMD9 ready, data-start token
    rx.extend([
        0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0xE9, 0x2F, 0x7F, 0x80, 0x0A, 0x40, 0x40,
        0xC7,
    ]);
    let mut h = harness(rx, true);
    h.sd.variant = Some(CardVariant::SdV2Sdhc);

    let sectors = h.sd.sector_count().expect("CSD read should succeed");
    assert_eq!(sectors, 0x03A4_C000);
}

/// P1: after any public operation, chip-select ends high and exactly one
/// dummy byte is clocked after the final rising edge.
#[test]
fn p1_cs_discipline_on_read_failure() {
    // No 0xFE token is ever supplied, so read_block times out.
    let mut h = harness(vec![0x00 /* CMD17 ready */], true);
    h.sd.variant = Some(CardVariant::SdV2Sdhc);

    let mut buf = [0u8; 512];
    let result = h.sd.read_block(0, &mut buf);
    assert!(matches!(result, Err(Error::ReadBlockFailed)));

    assert_eq!(h.cs_history.borrow().last(), Some(&true));
    assert_eq!(h.tx_log.borrow().last(), Some(&0xFF));
}

/// P5: `read_block`'s token wait aborts within the 200ms simulated budget
/// rather than spinning forever.
#[test]
fn p5_read_block_timeout_is_bounded() {
    let mut h = harness(vec![0x00 /* CMD17 ready */], true);
    h.sd.variant = Some(CardVariant::SdV2Sdhc);

    let mut buf = [0u8; 512];
    let result = h.sd.read_block(0, &mut buf);
    assert!(matches!(result, Err(Error::ReadBlockFailed)));
}

/// P3: a non-high-capacity card shifts the LBA left by 9 (i.e. ×512) before
/// it goes on the wire.
#[test]
fn p3_addressing_translation_for_standard_capacity() {
    let mut h = harness(vec![0x00 /* CMD17 ready */], true);
    h.sd.variant = Some(CardVariant::SdV1);

    let mut buf = [0u8; 512];
    let _ = h.sd.read_block(0x0000_0002, &mut buf);

    // CMD17 (0x11 | 0x40 = 0x51), argument 0x0000_0002 * 512 = 0x0000_0400.
    let tx = h.tx_log.borrow();
    assert!(tx.windows(6).any(|w| w == [0x51, 0x00, 0x00, 0x04, 0x00, 0x01]));
}

#[test]
fn is_present_respects_active_level() {
    let mut h = harness(Vec::new(), true);
    assert!(h.sd.is_present());

    let mut h = harness(Vec::new(), false);
    assert!(!h.sd.is_present());
}

/// P2: command frames carry the real CRC7 for CMD0/CMD8 (the only two
/// commands sent before CRC checking is disabled).
#[test]
fn p2_command_frame_bytes_exact() {
    let mut rx = power_up();
    rx.extend([0x01, 0x01]); // CMD0 -> idle, CMD8 -> idle
    let mut h = harness(rx, true);

    let _ = h.sd.init();

    let tx = h.tx_log.borrow();
    assert!(tx.windows(6).any(|w| w == [0x40, 0x00, 0x00, 0x00, 0x00, 0x95]));
    assert!(tx.windows(6).any(|w| w == [0x48, 0x00, 0x00, 0x01, 0xAA, 0x87]));
}

/// P4: a block transfer is exactly 512 data bytes plus 2 trailing CRC
/// bytes, never more or less.
#[test]
fn p4_read_data_phase_is_512_plus_2_bytes() {
    let mut rx = vec![0x00, 0xFE]; // CMD17 ready, data-start token
    rx.extend(vec![0xAA; 512]); // data
    rx.extend([0xBB, 0xCC]); // CRC, discarded

    let mut h = harness(rx, true);
    h.sd.variant = Some(CardVariant::SdV2Sdhc);

    let mut buf = [0u8; 512];
    h.sd.read_block(0, &mut buf).expect("read should succeed");
    assert_eq!(buf, [0xAA; 512]);

    let tx = h.tx_log.borrow();
    // CMD17 frame (6) + ready read (1) + token poll (1) + 512 data + 2 CRC
    // + finish's trailing dummy byte (1).
    assert_eq!(tx.len(), 6 + 1 + 1 + 512 + 2 + 1);
}

/// P6: re-running `init` on an already-initialized handle simply re-derives
/// the same variant rather than erroring or leaving stale state.
#[test]
fn p6_init_is_idempotent() {
    fn sdhc_bytes() -> Vec<u8> {
        vec![
            0x01, 0x01, 0x00, 0x00, 0x01, 0xAA, 0x01, 0x00, 0x00, 0xC0, 0xFF, 0x80, 0x00,
        ]
    }
    let mut rx = power_up();
    rx.extend(sdhc_bytes());
    rx.extend(power_up());
    rx.extend(sdhc_bytes());
    let mut h = harness(rx, true);

    h.sd.init().expect("first init should succeed");
    assert_eq!(h.sd.variant(), Some(CardVariant::SdV2Sdhc));

    h.sd.init().expect("second init should succeed");
    assert_eq!(h.sd.variant(), Some(CardVariant::SdV2Sdhc));
    assert!(h.sd.is_initialized());
}

#[test]
fn read_blocks_reads_each_block_and_stops_transmission() {
    let mut rx = vec![0x00]; // CMD18 ready
    for _ in 0..2 {
        rx.push(0xFE); // data-start token
        rx.extend(vec![0xAA; 512]);
        rx.extend([0xBB, 0xCC]); // CRC
    }
    rx.extend([0xAA, 0x00]); // CMD12's leading stuff byte, then its response

    let mut h = harness(rx, true);
    h.sd.variant = Some(CardVariant::SdV2Sdhc);

    let mut buf = [0u8; 1024];
    h.sd.read_blocks(0, &mut buf, 2).expect("multi-block read should succeed");
    assert_eq!(&buf[..], &[0xAAu8; 1024][..]);

    // CMD12 (0x0C | 0x40 = 0x4C) was issued to stop transmission.
    let tx = h.tx_log.borrow();
    assert!(tx.windows(6).any(|w| w == [0x4C, 0x00, 0x00, 0x00, 0x00, 0x01]));
}

#[test]
fn write_blocks_preerases_and_stops_transmission() {
    let rx = vec![
        0x00, // CMD55 (ACMD23 escape)
        0x00, // ACMD23
        0x00, // CMD25 ready
        0xAA, 0xAA, 0xE5, 0x01, // block 1: CRC filler, response, busy
        0xAA, 0xAA, 0xE5, 0x01, // block 2: CRC filler, response, busy
        0x01, // final busy-wait
    ];
    let mut h = harness(rx, true);
    h.sd.variant = Some(CardVariant::SdV2Sdhc);

    let data = [0u8; 1024];
    h.sd
        .write_blocks(0x0000_0010, &data, 2)
        .expect("multi-block write should succeed");

    let tx = h.tx_log.borrow();
    // ACMD23 (0x17 | 0x40 = 0x57), argument 2.
    assert!(tx.windows(6).any(|w| w == [0x57, 0x00, 0x00, 0x00, 0x02, 0x01]));
    assert_eq!(tx.iter().filter(|&&b| b == WRITE_MULTIPLE_TOKEN).count(), 2);
    assert!(tx.iter().any(|&b| b == STOP_TRAN_TOKEN));
}

#[test]
fn erase_blocks_issues_start_end_and_execute() {
    let mut h = harness(vec![0x00, 0x00, 0x00, 0x01], true);
    h.sd.variant = Some(CardVariant::SdV2Sdhc);

    h.sd.erase_blocks(0x10, 4).expect("erase should succeed");

    let tx = h.tx_log.borrow();
    // CMD32 (0x60) start = 0x10, CMD33 (0x61) end = 0x13, CMD38 (0x66).
    assert!(tx.windows(6).any(|w| w == [0x60, 0x00, 0x00, 0x00, 0x10, 0x01]));
    assert!(tx.windows(6).any(|w| w == [0x61, 0x00, 0x00, 0x00, 0x13, 0x01]));
    assert!(tx.windows(6).any(|w| w == [0x66, 0x00, 0x00, 0x00, 0x00, 0x01]));
}

#[test]
fn is_busy_reads_a_single_status_byte() {
    let mut h = harness(vec![0x00], true);
    assert!(h.sd.is_busy());

    let mut h = harness(vec![0x01], true);
    assert!(!h.sd.is_busy());
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
