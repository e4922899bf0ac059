//! Canonical human-readable interfaces of the card registry and the
//! marketplace. Used as the default handle configuration and by the devnet.

pub const CARD_REGISTRY_INTERFACE: &[&str] = &[
    "function mintCard(address recipient, string tokenURI, string cardType, string rarity) returns (uint256)",
    "function userMintCard(string tokenURI, string cardType, string rarity) returns (uint256)",
    "function balanceOf(address owner) view returns (uint256)",
    "function tokenOfOwnerByIndex(address owner, uint256 index) view returns (uint256)",
    "function getCardInfo(uint256 tokenId) view returns (string, string, string)",
    "function ownerOf(uint256 tokenId) view returns (address)",
    "function tokenURI(uint256 tokenId) view returns (string)",
    "function setApprovalForAll(address operator, bool approved)",
    "function isApprovedForAll(address owner, address operator) view returns (bool)",
    "function transferFrom(address from, address to, uint256 tokenId)",
    "function owner() view returns (address)",
    "function toggleEmergencyStop()",
    "event Transfer(address indexed from, address indexed to, uint256 indexed tokenId)",
];

pub const MARKETPLACE_INTERFACE: &[&str] = &[
    "function listCard(uint256 tokenId, uint256 price, bool isAuction, uint256 duration)",
    "function buyCard(uint256 tokenId) payable",
    "function placeBid(uint256 tokenId) payable",
    "function endAuction(uint256 tokenId)",
    "function withdraw()",
    "function listings(uint256 tokenId) view returns (address seller, uint256 price, bool isAuction, uint256 highestBid, address highestBidder, uint256 endTime)",
    "function pendingWithdrawals(address account) view returns (uint256)",
    "function toggleEmergencyStop()",
    "event Listed(uint256 indexed tokenId, address indexed seller, uint256 price, bool isAuction)",
    "event Purchased(uint256 indexed tokenId, address indexed buyer, uint256 price)",
    "event BidPlaced(uint256 indexed tokenId, address indexed bidder, uint256 amount)",
    "event AuctionEnded(uint256 indexed tokenId, address indexed winner, uint256 amount)",
];
