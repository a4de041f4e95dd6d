//------------ Answer --------------------------------------------------------

use crate::base::Rcode;

/// The answer a zone’s content gives to a question.
///
/// Records are kept in wire format, ready to be appended after the
/// question section of the response. Names inside them must not use
/// compression pointers other than to offset 12, the question name.
#[derive(Clone, Debug)]
pub struct Answer {
    /// The response code of the answer.
    rcode: Rcode,

    /// The answer section records.
    answer: Vec<u8>,

    /// The number of records in `answer`.
    ancount: u16,

    /// The authority section records.
    authority: Vec<u8>,

    /// The number of records in `authority`.
    nscount: u16,
}

impl Answer {
    pub fn new(rcode: Rcode) -> Self {
        Answer {
            rcode,
            answer: Vec::new(),
            ancount: 0,
            authority: Vec::new(),
            nscount: 0,
        }
    }

    pub fn rcode(&self) -> Rcode {
        self.rcode
    }

    /// Appends one wire-format record to the answer section.
    pub fn push_answer(&mut self, record: &[u8]) {
        self.answer.extend_from_slice(record);
        self.ancount = self.ancount.saturating_add(1);
    }

    /// Appends one wire-format record to the authority section.
    pub fn push_authority(&mut self, record: &[u8]) {
        self.authority.extend_from_slice(record);
        self.nscount = self.nscount.saturating_add(1);
    }

    pub fn ancount(&self) -> u16 {
        self.ancount
    }

    pub fn nscount(&self) -> u16 {
        self.nscount
    }

    pub fn answer_section(&self) -> &[u8] {
        &self.answer
    }

    pub fn authority_section(&self) -> &[u8] {
        &self.authority
    }
}
