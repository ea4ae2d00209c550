//! Composition data page 0 and the element/model description of a node
//!
//! Wire layout (all fields little-endian):
//!   CID(2) | PID(2) | VID(2) | CRPL(2) | Features(2) | Element*
//!   Element = Loc(2) | NumS(1) | NumV(1) | SIG model IDs(2 each) | Vendor model IDs(4 each)

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::UNASSIGNED_ADDRESS;
use crate::error::{MeshError, Result};

/// A SIG or vendor model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MeshModel {
    Sig { model_id: u16 },
    Vendor { company_id: u16, model_id: u16 },
}

impl MeshModel {
    pub fn sig(model_id: u16) -> Self {
        MeshModel::Sig { model_id }
    }

    pub fn vendor(company_id: u16, model_id: u16) -> Self {
        MeshModel::Vendor {
            company_id,
            model_id,
        }
    }

    /// Model identifier: 16-bit for SIG models, `company << 16 | model` for vendor models
    pub fn id(&self) -> u32 {
        match *self {
            MeshModel::Sig { model_id } => model_id as u32,
            MeshModel::Vendor {
                company_id,
                model_id,
            } => (company_id as u32) << 16 | model_id as u32,
        }
    }

    pub fn is_sig(&self) -> bool {
        matches!(self, MeshModel::Sig { .. })
    }

    /// Human readable name of well-known SIG models
    pub fn name(&self) -> Option<&'static str> {
        let MeshModel::Sig { model_id } = *self else {
            return None;
        };
        let name = match model_id {
            0x0000 => "Configuration Server",
            0x0001 => "Configuration Client",
            0x0002 => "Health Server",
            0x0003 => "Health Client",
            0x1000 => "Generic OnOff Server",
            0x1001 => "Generic OnOff Client",
            0x1002 => "Generic Level Server",
            0x1003 => "Generic Level Client",
            0x1004 => "Generic Default Transition Time Server",
            0x1005 => "Generic Default Transition Time Client",
            0x1006 => "Generic Power OnOff Server",
            0x1007 => "Generic Power OnOff Setup Server",
            0x1008 => "Generic Power OnOff Client",
            0x1100 => "Sensor Server",
            0x1101 => "Sensor Setup Server",
            0x1102 => "Sensor Client",
            0x1200 => "Time Server",
            0x1203 => "Scene Server",
            0x1204 => "Scene Setup Server",
            0x1205 => "Scene Client",
            0x1300 => "Light Lightness Server",
            0x1301 => "Light Lightness Setup Server",
            0x1302 => "Light Lightness Client",
            0x1303 => "Light CTL Server",
            0x1304 => "Light CTL Setup Server",
            0x1305 => "Light CTL Client",
            0x1307 => "Light HSL Server",
            0x1308 => "Light HSL Setup Server",
            0x1309 => "Light HSL Client",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for MeshModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.name()) {
            (MeshModel::Sig { model_id }, Some(name)) => write!(f, "{} (0x{:04X})", name, model_id),
            (MeshModel::Sig { model_id }, None) => write!(f, "SIG model 0x{:04X}", model_id),
            (
                MeshModel::Vendor {
                    company_id,
                    model_id,
                },
                _,
            ) => write!(
                f,
                "Vendor model 0x{:04X} (company 0x{:04X})",
                model_id, company_id
            ),
        }
    }
}

/// Features field of the composition data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub relay: bool,
    pub proxy: bool,
    pub friend: bool,
    pub low_power: bool,
}

impl Features {
    pub fn from_bits(bits: u16) -> Self {
        Self {
            relay: bits & 0x0001 != 0,
            proxy: bits & 0x0002 != 0,
            friend: bits & 0x0004 != 0,
            low_power: bits & 0x0008 != 0,
        }
    }

    pub fn bits(&self) -> u16 {
        (self.relay as u16)
            | (self.proxy as u16) << 1
            | (self.friend as u16) << 2
            | (self.low_power as u16) << 3
    }
}

/// An element: location descriptor plus models in declaration order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub location: u16,
    pub models: Vec<MeshModel>,
    /// Unicast address once attached to a provisioned node, unassigned before
    #[serde(default)]
    pub address: u16,
}

impl Element {
    pub fn new(location: u16, models: Vec<MeshModel>) -> Self {
        Self {
            location,
            models,
            address: UNASSIGNED_ADDRESS,
        }
    }

    pub fn model(&self, id: u32) -> Option<&MeshModel> {
        self.models.iter().find(|m| m.id() == id)
    }

    pub fn sig_model_count(&self) -> usize {
        self.models.iter().filter(|m| m.is_sig()).count()
    }

    pub fn vendor_model_count(&self) -> usize {
        self.models.len() - self.sig_model_count()
    }
}

/// Composition data page 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionData {
    pub company_id: u16,
    pub product_id: u16,
    pub version_id: u16,
    /// Minimum number of replay protection list entries
    pub crpl: u16,
    pub features: Features,
    pub elements: Vec<Element>,
}

impl CompositionData {
    /// Parse the body of composition data page 0
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 10 {
            return Err(MeshError::malformed(format!(
                "composition data too short: {} bytes (minimum 10)",
                data.len()
            )));
        }

        let mut buf = data;
        let company_id = buf.get_u16_le();
        let product_id = buf.get_u16_le();
        let version_id = buf.get_u16_le();
        let crpl = buf.get_u16_le();
        let features = Features::from_bits(buf.get_u16_le());

        let mut elements = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(MeshError::malformed("truncated element header"));
            }
            let location = buf.get_u16_le();
            let num_s = buf.get_u8() as usize;
            let num_v = buf.get_u8() as usize;

            let needed = num_s * 2 + num_v * 4;
            if buf.remaining() < needed {
                return Err(MeshError::malformed(format!(
                    "element {} declares {} SIG and {} vendor models but only {} bytes remain",
                    elements.len(),
                    num_s,
                    num_v,
                    buf.remaining()
                )));
            }

            let mut models = Vec::with_capacity(num_s + num_v);
            for _ in 0..num_s {
                models.push(MeshModel::sig(buf.get_u16_le()));
            }
            for _ in 0..num_v {
                let company_id = buf.get_u16_le();
                let model_id = buf.get_u16_le();
                models.push(MeshModel::vendor(company_id, model_id));
            }
            elements.push(Element::new(location, models));
        }

        if elements.is_empty() {
            return Err(MeshError::malformed("composition data has no elements"));
        }

        Ok(Self {
            company_id,
            product_id,
            version_id,
            crpl,
            features,
            elements,
        })
    }

    /// Parse a Composition Data Status body (`Page || Data`); only page 0 is understood
    pub fn parse_status(status: &[u8]) -> Result<Self> {
        match status.split_first() {
            Some((0, data)) => Self::parse(data),
            Some((page, _)) => Err(MeshError::malformed(format!(
                "unsupported composition data page {}",
                page
            ))),
            None => Err(MeshError::malformed("empty composition data status")),
        }
    }

    /// Encode back to page 0 bytes. SIG models are written before vendor
    /// models within each element, as the wire format requires.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(10 + self.elements.len() * 8);
        buf.put_u16_le(self.company_id);
        buf.put_u16_le(self.product_id);
        buf.put_u16_le(self.version_id);
        buf.put_u16_le(self.crpl);
        buf.put_u16_le(self.features.bits());

        for element in &self.elements {
            buf.put_u16_le(element.location);
            buf.put_u8(element.sig_model_count() as u8);
            buf.put_u8(element.vendor_model_count() as u8);
            for model in element.models.iter().filter(|m| m.is_sig()) {
                buf.put_u16_le(model.id() as u16);
            }
            for model in &element.models {
                if let MeshModel::Vendor {
                    company_id,
                    model_id,
                } = *model
                {
                    buf.put_u16_le(company_id);
                    buf.put_u16_le(model_id);
                }
            }
        }
        buf.to_vec()
    }

    /// Address of element `index` on a node whose primary element is `primary`
    pub fn element_address(primary: u16, index: usize) -> u16 {
        primary.wrapping_add(index as u16)
    }

    /// Give every element its address on a node whose primary element is `primary`
    pub fn assign_addresses(&mut self, primary: u16) {
        for (index, element) in self.elements.iter_mut().enumerate() {
            element.address = Self::element_address(primary, index);
        }
    }

    /// Element at `address` on a node whose primary element is `primary`
    pub fn element_by_address(&self, primary: u16, address: u16) -> Option<&Element> {
        let offset = address.checked_sub(primary)? as usize;
        self.elements.get(offset)
    }

    /// First element containing a model with this identifier, and its index
    pub fn model_by_id(&self, id: u32) -> Option<(usize, &MeshModel)> {
        self.elements
            .iter()
            .enumerate()
            .find_map(|(i, e)| e.model(id).map(|m| (i, m)))
    }

    pub fn sig_model_count(&self) -> usize {
        self.elements.iter().map(Element::sig_model_count).sum()
    }

    pub fn vendor_model_count(&self) -> usize {
        self.elements.iter().map(Element::vendor_model_count).sum()
    }
}
