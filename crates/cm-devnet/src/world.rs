//! Contract state and method semantics of the card registry and the
//! marketplace. A `World` is cloned before every transaction and only
//! committed when the call succeeds, so a revert leaves no trace.

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, U256};
use cm_api_types::CardMetadata;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::abi::{Revert, address_arg, bool_arg, require, string_arg, uint, uint_arg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFault {
    /// `getCardInfo` reverts; `tokenURI` still answers.
    CardInfo,
    /// Every metadata read reverts.
    All,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Registry {
    pub(crate) owner: Address,
    pub(crate) next_token_id: u64,
    pub(crate) owners: BTreeMap<U256, Address>,
    pub(crate) cards: BTreeMap<U256, CardMetadata>,
    pub(crate) holdings: HashMap<Address, Vec<U256>>,
    pub(crate) operators: HashSet<(Address, Address)>,
    pub(crate) emergency_stop: bool,
    pub(crate) enumerable: bool,
    pub(crate) metadata_faults: HashMap<U256, MetadataFault>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ListingSlot {
    pub(crate) seller: Address,
    pub(crate) price: U256,
    pub(crate) is_auction: bool,
    pub(crate) highest_bid: U256,
    pub(crate) highest_bidder: Address,
    pub(crate) end_time: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Marketplace {
    pub(crate) owner: Address,
    pub(crate) listings: BTreeMap<U256, ListingSlot>,
    pub(crate) pending_withdrawals: HashMap<Address, U256>,
    pub(crate) emergency_stop: bool,
}

/// Event emitted during execution, encoded once the transaction commits.
#[derive(Debug, Clone)]
pub(crate) struct Emitted {
    pub(crate) contract: Address,
    pub(crate) event: &'static str,
    pub(crate) values: Vec<DynSolValue>,
}

pub(crate) struct Frame {
    pub(crate) sender: Address,
    pub(crate) value: U256,
    pub(crate) timestamp: u64,
    pub(crate) emitted: Vec<Emitted>,
}

#[derive(Debug, Clone)]
pub(crate) struct World {
    pub(crate) registry_address: Address,
    pub(crate) marketplace_address: Address,
    pub(crate) balances: HashMap<Address, U256>,
    pub(crate) registry: Registry,
    pub(crate) marketplace: Marketplace,
}

impl World {
    pub(crate) fn new(
        registry_address: Address,
        marketplace_address: Address,
        deployer: Address,
        funded: &[Address],
        initial_balance: U256,
    ) -> Self {
        Self {
            registry_address,
            marketplace_address,
            balances: funded.iter().map(|account| (*account, initial_balance)).collect(),
            registry: Registry {
                owner: deployer,
                next_token_id: 1,
                enumerable: true,
                ..Registry::default()
            },
            marketplace: Marketplace {
                owner: deployer,
                ..Marketplace::default()
            },
        }
    }

    pub(crate) fn balance(&self, account: Address) -> U256 {
        self.balances.get(&account).copied().unwrap_or_default()
    }

    pub(crate) fn move_funds(&mut self, from: Address, to: Address, amount: U256) -> Result<(), Revert> {
        if amount.is_zero() {
            return Ok(());
        }
        let available = self.balance(from);
        require(available >= amount, "insufficient balance")?;
        self.balances.insert(from, available - amount);
        *self.balances.entry(to).or_default() += amount;
        Ok(())
    }

    pub(crate) fn invoke_registry(
        &mut self,
        frame: &mut Frame,
        method: &str,
        args: &[DynSolValue],
    ) -> Result<Vec<DynSolValue>, Revert> {
        match method {
            "mintCard" => {
                require(frame.sender == self.registry.owner, "Ownable: caller is not the owner")?;
                let recipient = address_arg(args, 0)?;
                let metadata = CardMetadata {
                    uri: string_arg(args, 1)?,
                    card_type: string_arg(args, 2)?,
                    rarity: string_arg(args, 3)?,
                };
                let token_id = self.mint(frame, recipient, metadata)?;
                Ok(vec![uint(token_id)])
            }
            "userMintCard" => {
                let metadata = CardMetadata {
                    uri: string_arg(args, 0)?,
                    card_type: string_arg(args, 1)?,
                    rarity: string_arg(args, 2)?,
                };
                let sender = frame.sender;
                let token_id = self.mint(frame, sender, metadata)?;
                Ok(vec![uint(token_id)])
            }
            "balanceOf" => {
                let owner = address_arg(args, 0)?;
                let count = self.registry.holdings.get(&owner).map_or(0, Vec::len);
                Ok(vec![uint(U256::from(count))])
            }
            "tokenOfOwnerByIndex" => {
                // A registry without the enumerable extension has no such method.
                require(self.registry.enumerable, "")?;
                let owner = address_arg(args, 0)?;
                let index: usize = uint_arg(args, 1)?.saturating_to();
                let token_id = self
                    .registry
                    .holdings
                    .get(&owner)
                    .and_then(|tokens| tokens.get(index))
                    .copied()
                    .ok_or_else(|| Revert::new("ERC721Enumerable: owner index out of bounds"))?;
                Ok(vec![uint(token_id)])
            }
            "getCardInfo" => {
                let token_id = uint_arg(args, 0)?;
                require(
                    !self.registry.metadata_faults.contains_key(&token_id),
                    "card metadata unavailable",
                )?;
                let card = self
                    .registry
                    .cards
                    .get(&token_id)
                    .ok_or_else(|| Revert::new("Card does not exist"))?;
                Ok(vec![
                    DynSolValue::String(card.uri.clone()),
                    DynSolValue::String(card.card_type.clone()),
                    DynSolValue::String(card.rarity.clone()),
                ])
            }
            "tokenURI" => {
                let token_id = uint_arg(args, 0)?;
                require(
                    self.registry.metadata_faults.get(&token_id) != Some(&MetadataFault::All),
                    "token uri unavailable",
                )?;
                let card = self
                    .registry
                    .cards
                    .get(&token_id)
                    .ok_or_else(|| Revert::new("ERC721: invalid token ID"))?;
                Ok(vec![DynSolValue::String(card.uri.clone())])
            }
            "ownerOf" => {
                let token_id = uint_arg(args, 0)?;
                Ok(vec![DynSolValue::Address(self.owner_of(token_id)?)])
            }
            "setApprovalForAll" => {
                let operator = address_arg(args, 0)?;
                let approved = bool_arg(args, 1)?;
                if approved {
                    self.registry.operators.insert((frame.sender, operator));
                } else {
                    self.registry.operators.remove(&(frame.sender, operator));
                }
                Ok(Vec::new())
            }
            "isApprovedForAll" => {
                let owner = address_arg(args, 0)?;
                let operator = address_arg(args, 1)?;
                Ok(vec![DynSolValue::Bool(self.is_operator(owner, operator))])
            }
            "transferFrom" => {
                let from = address_arg(args, 0)?;
                let to = address_arg(args, 1)?;
                let token_id = uint_arg(args, 2)?;
                require(
                    frame.sender == from || self.is_operator(from, frame.sender),
                    "ERC721: caller is not token owner or approved",
                )?;
                self.transfer(frame, from, to, token_id)?;
                Ok(Vec::new())
            }
            "owner" => Ok(vec![DynSolValue::Address(self.registry.owner)]),
            "toggleEmergencyStop" => {
                require(frame.sender == self.registry.owner, "Ownable: caller is not the owner")?;
                self.registry.emergency_stop = !self.registry.emergency_stop;
                Ok(Vec::new())
            }
            _ => Err(Revert::new("")),
        }
    }

    pub(crate) fn invoke_marketplace(
        &mut self,
        frame: &mut Frame,
        method: &str,
        args: &[DynSolValue],
    ) -> Result<Vec<DynSolValue>, Revert> {
        match method {
            "listCard" => {
                let token_id = uint_arg(args, 0)?;
                let price = uint_arg(args, 1)?;
                let is_auction = bool_arg(args, 2)?;
                let duration: u64 = uint_arg(args, 3)?.saturating_to();
                self.list_card(frame, token_id, price, is_auction, duration)?;
                Ok(Vec::new())
            }
            "buyCard" => {
                self.buy_card(frame, uint_arg(args, 0)?)?;
                Ok(Vec::new())
            }
            "placeBid" => {
                self.place_bid(frame, uint_arg(args, 0)?)?;
                Ok(Vec::new())
            }
            "endAuction" => {
                self.end_auction(frame, uint_arg(args, 0)?)?;
                Ok(Vec::new())
            }
            "withdraw" => {
                let amount = self
                    .marketplace
                    .pending_withdrawals
                    .remove(&frame.sender)
                    .unwrap_or_default();
                require(!amount.is_zero(), "Marketplace: nothing to withdraw")?;
                self.move_funds(self.marketplace_address, frame.sender, amount)?;
                Ok(Vec::new())
            }
            "listings" => {
                let token_id = uint_arg(args, 0)?;
                let slot = self.marketplace.listings.get(&token_id).cloned().unwrap_or_default();
                Ok(vec![
                    DynSolValue::Address(slot.seller),
                    uint(slot.price),
                    DynSolValue::Bool(slot.is_auction),
                    uint(slot.highest_bid),
                    DynSolValue::Address(slot.highest_bidder),
                    uint(U256::from(slot.end_time)),
                ])
            }
            "pendingWithdrawals" => {
                let account = address_arg(args, 0)?;
                let amount = self
                    .marketplace
                    .pending_withdrawals
                    .get(&account)
                    .copied()
                    .unwrap_or_default();
                Ok(vec![uint(amount)])
            }
            "toggleEmergencyStop" => {
                require(frame.sender == self.marketplace.owner, "Ownable: caller is not the owner")?;
                self.marketplace.emergency_stop = !self.marketplace.emergency_stop;
                Ok(Vec::new())
            }
            _ => Err(Revert::new("")),
        }
    }

    fn mint(&mut self, frame: &mut Frame, recipient: Address, metadata: CardMetadata) -> Result<U256, Revert> {
        require(!self.registry.emergency_stop, "Contract is in emergency stop mode")?;
        require(recipient != Address::ZERO, "ERC721: mint to the zero address")?;

        let token_id = U256::from(self.registry.next_token_id);
        self.registry.next_token_id += 1;
        self.registry.cards.insert(token_id, metadata);
        self.registry.owners.insert(token_id, recipient);
        self.registry.holdings.entry(recipient).or_default().push(token_id);
        frame.emitted.push(Emitted {
            contract: self.registry_address,
            event: "Transfer",
            values: vec![
                DynSolValue::Address(Address::ZERO),
                DynSolValue::Address(recipient),
                uint(token_id),
            ],
        });
        Ok(token_id)
    }

    fn owner_of(&self, token_id: U256) -> Result<Address, Revert> {
        self.registry
            .owners
            .get(&token_id)
            .copied()
            .ok_or_else(|| Revert::new("ERC721: invalid token ID"))
    }

    fn is_operator(&self, owner: Address, operator: Address) -> bool {
        self.registry.operators.contains(&(owner, operator))
    }

    fn transfer(&mut self, frame: &mut Frame, from: Address, to: Address, token_id: U256) -> Result<(), Revert> {
        require(self.owner_of(token_id)? == from, "ERC721: transfer from incorrect owner")?;
        require(to != Address::ZERO, "ERC721: transfer to the zero address")?;

        if let Some(tokens) = self.registry.holdings.get_mut(&from) {
            if let Some(position) = tokens.iter().position(|id| *id == token_id) {
                tokens.swap_remove(position);
            }
        }
        self.registry.holdings.entry(to).or_default().push(token_id);
        self.registry.owners.insert(token_id, to);
        frame.emitted.push(Emitted {
            contract: self.registry_address,
            event: "Transfer",
            values: vec![DynSolValue::Address(from), DynSolValue::Address(to), uint(token_id)],
        });
        Ok(())
    }

    fn list_card(
        &mut self,
        frame: &mut Frame,
        token_id: U256,
        price: U256,
        is_auction: bool,
        duration: u64,
    ) -> Result<(), Revert> {
        require(!self.marketplace.emergency_stop, "Marketplace: Emergency stop is active")?;
        let owner = self.owner_of(token_id)?;
        require(owner == frame.sender, "Marketplace: caller is not the card owner")?;
        require(
            self.is_operator(owner, self.marketplace_address),
            "Marketplace: marketplace is not approved",
        )?;
        require(!price.is_zero(), "Marketplace: price must be greater than zero")?;
        require(!is_auction || duration > 0, "Marketplace: auction duration must be positive")?;
        if let Some(existing) = self.marketplace.listings.get(&token_id) {
            // A record left behind by a transfer outside the marketplace may be replaced.
            require(existing.seller != owner, "Marketplace: card already listed")?;
        }

        self.marketplace.listings.insert(
            token_id,
            ListingSlot {
                seller: owner,
                price,
                is_auction,
                highest_bid: if is_auction { price } else { U256::ZERO },
                highest_bidder: Address::ZERO,
                end_time: if is_auction { frame.timestamp + duration } else { 0 },
            },
        );
        frame.emitted.push(Emitted {
            contract: self.marketplace_address,
            event: "Listed",
            values: vec![
                uint(token_id),
                DynSolValue::Address(owner),
                uint(price),
                DynSolValue::Bool(is_auction),
            ],
        });
        Ok(())
    }

    fn open_listing(&self, token_id: U256) -> Result<ListingSlot, Revert> {
        self.marketplace
            .listings
            .get(&token_id)
            .filter(|slot| slot.seller != Address::ZERO)
            .cloned()
            .ok_or_else(|| Revert::new("Marketplace: card is not listed"))
    }

    fn buy_card(&mut self, frame: &mut Frame, token_id: U256) -> Result<(), Revert> {
        require(!self.marketplace.emergency_stop, "Marketplace: Emergency stop is active")?;
        let slot = self.open_listing(token_id)?;
        require(!slot.is_auction, "Marketplace: card is listed for auction")?;
        require(frame.value == slot.price, "Marketplace: incorrect payment amount")?;
        require(frame.sender != slot.seller, "Marketplace: seller cannot buy own card")?;
        require(
            self.owner_of(token_id)? == slot.seller,
            "Marketplace: seller no longer owns the card",
        )?;

        let buyer = frame.sender;
        self.marketplace.listings.remove(&token_id);
        self.transfer(frame, slot.seller, buyer, token_id)?;
        *self.marketplace.pending_withdrawals.entry(slot.seller).or_default() += slot.price;
        frame.emitted.push(Emitted {
            contract: self.marketplace_address,
            event: "Purchased",
            values: vec![uint(token_id), DynSolValue::Address(buyer), uint(slot.price)],
        });
        Ok(())
    }

    fn place_bid(&mut self, frame: &mut Frame, token_id: U256) -> Result<(), Revert> {
        require(!self.marketplace.emergency_stop, "Marketplace: Emergency stop is active")?;
        let slot = self.open_listing(token_id)?;
        require(slot.is_auction, "Marketplace: card is not an auction")?;
        require(frame.timestamp < slot.end_time, "Marketplace: auction has ended")?;
        require(frame.sender != slot.seller, "Marketplace: seller cannot bid")?;
        require(frame.value > slot.highest_bid, "Marketplace: bid must exceed the highest bid")?;

        if slot.highest_bidder != Address::ZERO {
            *self
                .marketplace
                .pending_withdrawals
                .entry(slot.highest_bidder)
                .or_default() += slot.highest_bid;
        }
        if let Some(listing) = self.marketplace.listings.get_mut(&token_id) {
            listing.highest_bid = frame.value;
            listing.highest_bidder = frame.sender;
        }
        frame.emitted.push(Emitted {
            contract: self.marketplace_address,
            event: "BidPlaced",
            values: vec![uint(token_id), DynSolValue::Address(frame.sender), uint(frame.value)],
        });
        Ok(())
    }

    fn end_auction(&mut self, frame: &mut Frame, token_id: U256) -> Result<(), Revert> {
        let slot = self.open_listing(token_id)?;
        require(slot.is_auction, "Marketplace: card is not an auction")?;
        require(frame.timestamp >= slot.end_time, "Marketplace: auction has not ended")?;

        self.marketplace.listings.remove(&token_id);
        let mut winner = Address::ZERO;
        let mut amount = U256::ZERO;
        if slot.highest_bidder != Address::ZERO {
            if self.owner_of(token_id)? == slot.seller {
                self.transfer(frame, slot.seller, slot.highest_bidder, token_id)?;
                *self.marketplace.pending_withdrawals.entry(slot.seller).or_default() +=
                    slot.highest_bid;
                winner = slot.highest_bidder;
                amount = slot.highest_bid;
            } else {
                *self
                    .marketplace
                    .pending_withdrawals
                    .entry(slot.highest_bidder)
                    .or_default() += slot.highest_bid;
            }
        }
        frame.emitted.push(Emitted {
            contract: self.marketplace_address,
            event: "AuctionEnded",
            values: vec![uint(token_id), DynSolValue::Address(winner), uint(amount)],
        });
        Ok(())
    }
}
